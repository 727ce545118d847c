//! Delay timers.
//!
//! - [`FixedDelay`] compares an absolute start time against "now".
//! - [`DeltaDelay`] accumulates per-tick deltas.

use crate::clock::Seconds;

/// Delay anchored at an absolute start time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixedDelay {
    start: Seconds,
    delay: Seconds,
}

impl FixedDelay {
    pub fn new(start: Seconds, delay: Seconds) -> Self {
        Self { start, delay }
    }

    /// Re-arm the delay.
    pub fn start(&mut self, start: Seconds, delay: Seconds) {
        self.start = start;
        self.delay = delay;
    }

    /// True once `now` is strictly past `start + delay`.
    pub fn has_passed(&self, now: Seconds) -> bool {
        now > self.deadline()
    }

    pub fn deadline(&self) -> Seconds {
        self.start + self.delay
    }

    pub fn remaining(&self, now: Seconds) -> Seconds {
        (self.deadline() - now).max(0.0)
    }
}

/// Delay measured by summing tick deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeltaDelay {
    elapsed: Seconds,
    delay: Seconds,
}

impl DeltaDelay {
    pub fn new(delay: Seconds) -> Self {
        Self {
            elapsed: 0.0,
            delay,
        }
    }

    pub fn update(&mut self, dt: Seconds) {
        self.elapsed += dt;
    }

    /// True once the accumulated time reaches the delay.
    pub fn has_passed(&self) -> bool {
        self.elapsed >= self.delay
    }

    pub fn reset(&mut self) {
        self.elapsed = 0.0;
    }

    pub fn elapsed(&self) -> Seconds {
        self.elapsed
    }
}
