//! Scenegrid Node Process
//!
//! One process per cluster node. It owns:
//! - The directory endpoint ([`NodeService`])
//! - The scenes hosted on this node and their dynamic ports
//! - The predicted entities simulated here
//!
//! # Tick Order
//!
//! [`NodeProcess::tick`] runs once per fixed simulation step:
//!
//! 1. Drain the transport: directory messages are dispatched, prediction
//!    envelopes are routed to their entity
//! 2. Step every predicted entity
//! 3. Deliver loopback messages and expire pending requests and cached
//!    lookups
//! 4. Scan loading scenes for timeouts
//! 5. Settle confirmed registrations and hand queued scene registrations to
//!    the directory
//!
//! The [`network`] module provides an in-memory transport for running a
//! whole cluster inside one test.

#![deny(unsafe_code)]

pub mod network;
pub mod process;
pub mod registry;

use scenegrid_directory::DirectoryConfig;
use scenegrid_prediction::PredictionConfig;
use scenegrid_util::Seconds;

pub use network::{LinkConditions, MemoryEndpoint, MemoryNetwork, UnreliableDelivery};
pub use process::NodeProcess;
pub use registry::{
    DirectoryTask, SceneEntry, SceneEvent, SceneKind, SceneLoad, SceneRegistry, SpawnedEntity,
};
pub use scenegrid_directory::NodeService;
pub use scenegrid_sim::TICK_RATE_HZ;

// ============================================================================
// Parameters
// ============================================================================

/// How long a scene may take to load before `PendingSceneTimeout` is raised.
pub const PENDING_SCENE_LIFETIME_SECS: Seconds = 30.0;

// ============================================================================
// Configuration
// ============================================================================

/// Node process configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub directory: DirectoryConfig,
    pub prediction: PredictionConfig,
    pub pending_scene_lifetime: Seconds,
    /// Register dynamic scenes with the directory.
    pub register_dynamic_scenes: bool,
    /// Hold dynamic scenes unready until the directory confirms them.
    pub register_requires_confirmation: bool,
    pub tick_rate_hz: u32,
}

impl NodeConfig {
    /// Length of one fixed step.
    pub fn tick_interval(&self) -> Seconds {
        1.0 / Seconds::from(self.tick_rate_hz.max(1))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            prediction: PredictionConfig::default(),
            pending_scene_lifetime: PENDING_SCENE_LIFETIME_SECS,
            register_dynamic_scenes: true,
            register_requires_confirmation: false,
            tick_rate_hz: TICK_RATE_HZ,
        }
    }
}
