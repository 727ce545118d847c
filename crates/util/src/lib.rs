//! Scenegrid Utilities
//!
//! Small, engine-independent building blocks shared by the directory service,
//! the node process and the prediction engine.
//!
//! # Execution Model
//!
//! Everything in this crate is single-threaded and tick-driven. Nothing reads
//! wall-clock time and nothing runs in the background:
//! - Time comes from an injected [`Clock`]
//! - Expiry is detected only when the owner calls a step function
//!   (`update()` for a full sweep, `step()` for one item per call)
//!
//! # Contents
//!
//! - [`IdPool`]: bounded identifier allocator with optional recycling
//! - [`ExpiringMap`] / [`ExpiringList`]: time-keyed caches
//! - [`FixedDelay`] / [`DeltaDelay`]: delay timers
//! - [`Observers`]: handler list with explicit unsubscribe

#![deny(unsafe_code)]

pub mod cache;
pub mod clock;
pub mod delay;
pub mod id_pool;
pub mod observer;

pub use cache::{CacheItem, ExpiringList, ExpiringMap};
pub use clock::{Clock, ManualClock, Seconds, SharedClock};
pub use delay::{DeltaDelay, FixedDelay};
pub use id_pool::{IdPool, PoolId};
pub use observer::{Observers, SubscriptionId};
