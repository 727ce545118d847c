//! Scenegrid Prediction
//!
//! Client-side prediction and server reconciliation for one controlled
//! entity, advanced once per fixed simulation tick:
//!
//! 1. **Record**: the owner captures movement axes and actions.
//! 2. **Advance**: the frame counter increments and stamps the pending frame.
//! 3. **Save**: the pending frame is queued to play and to send.
//! 4. **Play**: the oldest queued frame is applied to the entity and recorded
//!    in the local history.
//! 5. **Sync**: every Nth tick the owner sends its saved frames to the
//!    authority (reliable) and the authority sends its played history back
//!    (unreliable).
//! 6. **Reconcile**: the owner compares the authority's positions with its
//!    own and replays from the authority's position when they diverge.

#![deny(unsafe_code)]

pub mod controller;
pub mod entity;
pub mod listener;

pub use controller::{NetworkedEntity, PredictionError, Role};
pub use entity::{PredictedBody, PredictedEntity};
pub use listener::{HistoryBatch, InputListener, Reconciliation};

/// Movement speed in units per second.
pub const DEFAULT_SPEED: f64 = 1.0;

/// Sync every Nth frame.
pub const DEFAULT_FRAME_SYNC_RATE: u32 = 1;

/// Largest tolerated distance between local and authoritative positions.
pub const DEFAULT_RECONCILE_DISTANCE: f64 = 0.6;

/// Per-entity prediction settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionConfig {
    pub speed: f64,
    pub frame_sync_rate: u32,
    pub reconcile_distance: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            speed: DEFAULT_SPEED,
            frame_sync_rate: DEFAULT_FRAME_SYNC_RATE,
            reconcile_distance: DEFAULT_RECONCILE_DISTANCE,
        }
    }
}
