//! Injected time source.
//!
//! Caches and timers never read the system clock. The host supplies "now"
//! (usually its fixed-update time) through a [`Clock`].

use std::cell::Cell;
use std::rc::Rc;

/// Game time in seconds.
pub type Seconds = f64;

/// Source of the current game time.
pub trait Clock {
    fn now(&self) -> Seconds;
}

impl<F: Fn() -> Seconds> Clock for F {
    fn now(&self) -> Seconds {
        self()
    }
}

/// Clock handle shared between the components of one node process.
pub type SharedClock = Rc<dyn Clock>;

/// Clock driven explicitly by the host tick loop.
///
/// Clones share the same underlying time, so one handle can be kept by the
/// tick loop while others are handed to caches.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Seconds>>,
}

impl ManualClock {
    pub fn new(start: Seconds) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Seconds) {
        self.now.set(now);
    }

    /// Move time forward by `dt` seconds.
    pub fn advance(&self, dt: Seconds) {
        self.now.set(self.now.get() + dt);
    }

    /// A [`SharedClock`] reading this clock.
    pub fn shared(&self) -> SharedClock {
        Rc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Seconds {
        self.now.get()
    }
}
