//! Scenegrid Node Directory
//!
//! A per-cluster registry that maps scene names to the node hosting them, and
//! relays cross-node instantiate and create-scene requests.
//!
//! One node of the cluster is the authority: it holds the registry and relays
//! requests between nodes. Every node (the authority included) talks to it
//! through the same [`NodeService`] entry points, each returning a
//! [`ServiceCallback`] that resolves exactly once.
//!
//! # Tick Contract
//!
//! The service never blocks and owns no timers. The host calls
//! [`NodeService::poll`] and [`NodeService::update`] once per simulation
//! tick; without them no reply is dispatched and no request ever times out.

#![deny(unsafe_code)]

pub mod callback;
pub mod host;
pub mod node;
pub mod service;

use scenegrid_util::Seconds;
use scenegrid_wire::CallbackId;

pub use callback::{Response, ServiceCallback};
pub use host::{CreateSceneRequest, InstantiateRequest, SceneHost};
pub use node::{
    Endpoint, Node, NodeMap, NodeMapError, NodeSceneTemplate, SceneSettings, SceneTemplate,
    TransportKind,
};
pub use scenegrid_wire::{CallbackState, NodeId};
pub use service::{DirectoryError, Lifecycle, NodeService};

/// How long a request waits for its reply before timing out.
pub const PENDING_CALLBACK_LIFETIME_SECS: Seconds = 30.0;

/// How long a successful lookup stays in the local read-through cache.
pub const SCENE_CACHE_LIFETIME_SECS: Seconds = 1800.0;

/// How expiry is detected on each [`NodeService::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpiryScan {
    /// Sweep every entry.
    #[default]
    Full,
    /// Inspect one entry per cache.
    Incremental,
}

/// Directory service configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub pending_callback_lifetime: Seconds,
    pub scene_cache_lifetime: Seconds,
    pub enable_lookup_caching: bool,
    pub expiry_scan: ExpiryScan,
    /// Upper bound of the callback id pool. Ids are never reused.
    pub max_callback_id: CallbackId,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            pending_callback_lifetime: PENDING_CALLBACK_LIFETIME_SECS,
            scene_cache_lifetime: SCENE_CACHE_LIFETIME_SECS,
            enable_lookup_caching: true,
            expiry_scan: ExpiryScan::Full,
            max_callback_id: CallbackId::MAX,
        }
    }
}
