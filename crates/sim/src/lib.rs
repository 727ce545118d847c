//! Scenegrid Simulation Core
//!
//! Deterministic, fixed-timestep movement model shared by the authority and
//! the controlling client. Both sides play the same [`InputFrame`]s through
//! [`MovementModel::apply`] and must arrive at comparable positions; the
//! prediction engine relies on that to detect and replay divergence.
//!
//! # Architecture Constraints
//!
//! This crate MUST NOT:
//! - Perform I/O operations
//! - Read wall-clock time
//! - Depend on frame rate or variable delta time
//!
//! Movement is a pure function of (position, speed, frame).

#![deny(unsafe_code)]

use std::ops::{Add, AddAssign, Mul, Sub};

// ============================================================================
// Type Aliases
// ============================================================================

/// Per-entity input frame counter. Monotonically increasing; frame 0 is
/// never recorded (the first advanced frame is 1).
pub type Frame = u32;

/// Discrete action code carried by an [`ActionFrame`].
pub type ActionId = u8;

// ============================================================================
// Spatial Types
// ============================================================================

/// 3D vector in world units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const UP: Self = Self::new(0.0, 1.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Self) -> f64 {
        (self - other).magnitude()
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Rotation quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// A discrete action recorded for one frame.
///
/// `data` is opaque to the listener; the movement model interprets it per
/// action code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFrame {
    pub action_id: ActionId,
    pub data: Vec<u8>,
}

impl ActionFrame {
    pub fn new(action_id: ActionId, data: Vec<u8>) -> Self {
        Self { action_id, data }
    }
}

/// Input captured for a single simulation tick.
///
/// Immutable once saved. Actions are sorted by `action_id` so both sides
/// apply them in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputFrame {
    pub frame: Frame,
    /// Horizontal axis in [-1, 1] (x).
    pub horizontal: f64,
    /// Vertical axis in [-1, 1] (z).
    pub vertical: f64,
    pub actions: Vec<ActionFrame>,
}

impl InputFrame {
    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// A played frame paired with the position it was applied from.
///
/// Replaying every frame from this item onward, starting at `position`,
/// reproduces the trajectory that followed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputHistoryItem {
    pub position: Vec3,
    pub input: InputFrame,
}

impl InputHistoryItem {
    pub fn frame(&self) -> Frame {
        self.input.frame
    }
}

// ============================================================================
// Movement Model Constants (Normative)
// ============================================================================

/// Simulation tick rate in Hz.
pub const TICK_RATE_HZ: u32 = 60;

/// Gravity magnitude used by the jump arc, in units per second.
pub const GRAVITY: f64 = 9.81;

/// Action code for a jump. Payload byte 0 is the jump step.
pub const ACTION_JUMP: ActionId = 1;

/// Jump steps below this value rise; steps from here to
/// [`JUMP_LAND_STEP`] fall.
pub const JUMP_APEX_STEP: u8 = 50;

/// First jump step that no longer moves the entity.
pub const JUMP_LAND_STEP: u8 = 100;

// ============================================================================
// Movement Model
// ============================================================================

/// Pure movement model.
///
/// - Movement: axes clamped to unit magnitude, then `* speed * dt` on the
///   x/z plane
/// - Jump: `+GRAVITY * dt` per step before the apex, `-GRAVITY * dt` per
///   step after it, nothing once landed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementModel {
    dt_seconds: f64,
}

impl MovementModel {
    /// # Panics
    /// If `tick_rate_hz` is zero.
    pub fn new(tick_rate_hz: u32) -> Self {
        assert!(tick_rate_hz > 0, "tick_rate_hz must be positive");

        Self {
            dt_seconds: 1.0 / f64::from(tick_rate_hz),
        }
    }

    pub fn dt_seconds(&self) -> f64 {
        self.dt_seconds
    }

    /// Displacement produced by the frame's movement axes.
    pub fn move_delta(&self, speed: f64, frame: &InputFrame) -> Vec3 {
        let [x, z] = clamp_magnitude([frame.horizontal, frame.vertical], 1.0);
        Vec3::new(x, 0.0, z) * (speed * self.dt_seconds)
    }

    /// Displacement produced by one action.
    pub fn action_delta(&self, action: &ActionFrame) -> Vec3 {
        match action.action_id {
            ACTION_JUMP => {
                let step = jump_step(action);
                if step < JUMP_APEX_STEP {
                    Vec3::UP * (GRAVITY * self.dt_seconds)
                } else if step < JUMP_LAND_STEP {
                    Vec3::UP * (-GRAVITY * self.dt_seconds)
                } else {
                    Vec3::ZERO
                }
            }
            _ => Vec3::ZERO,
        }
    }

    /// The action to record for the next frame after `action` was played,
    /// if it continues.
    pub fn follow_up(&self, action: &ActionFrame) -> Option<ActionFrame> {
        match action.action_id {
            ACTION_JUMP => {
                let next = jump_step(action).checked_add(1)?;
                (next < JUMP_LAND_STEP).then(|| ActionFrame::new(ACTION_JUMP, vec![next]))
            }
            _ => None,
        }
    }

    /// Position after playing `frame` from `position`.
    pub fn apply(&self, position: Vec3, speed: f64, frame: &InputFrame) -> Vec3 {
        let mut next = position + self.move_delta(speed, frame);
        for action in &frame.actions {
            next += self.action_delta(action);
        }
        next
    }

    /// Position after playing `frames` in order from `from`.
    pub fn replay<'a>(
        &self,
        from: Vec3,
        speed: f64,
        frames: impl IntoIterator<Item = &'a InputFrame>,
    ) -> Vec3 {
        frames
            .into_iter()
            .fold(from, |position, frame| self.apply(position, speed, frame))
    }
}

impl Default for MovementModel {
    fn default() -> Self {
        Self::new(TICK_RATE_HZ)
    }
}

fn jump_step(action: &ActionFrame) -> u8 {
    action.data.first().copied().unwrap_or(0)
}

/// Clamp a 2D vector's magnitude to a maximum value.
fn clamp_magnitude(v: [f64; 2], max_magnitude: f64) -> [f64; 2] {
    let magnitude_sq = v[0] * v[0] + v[1] * v[1];
    let max_sq = max_magnitude * max_magnitude;
    if magnitude_sq <= max_sq {
        v
    } else {
        let scale = max_magnitude / magnitude_sq.sqrt();
        [v[0] * scale, v[1] * scale]
    }
}

// ============================================================================
// Tests
// ============================================================================
