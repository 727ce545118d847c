//! The simulated entity a listener drives.

use scenegrid_sim::{ActionFrame, InputFrame, MovementModel, Vec3};

/// Movement and action behavior of a predicted entity.
///
/// The deltas must be deterministic: the owner and the authority play the
/// same frames through them, and reconciliation replays them.
pub trait PredictedEntity {
    fn position(&self) -> Vec3;

    fn set_position(&mut self, position: Vec3);

    /// Displacement produced by the frame's movement axes.
    fn move_delta(&self, speed: f64, frame: &InputFrame) -> Vec3;

    /// Displacement produced by one action.
    fn action_delta(&self, action: &ActionFrame) -> Vec3;

    /// The action to record for the next frame if `action` continues.
    fn follow_up(&self, action: &ActionFrame) -> Option<ActionFrame> {
        let _ = action;
        None
    }

    /// Position reached by playing `frame` from `position`.
    fn advance(&self, position: Vec3, speed: f64, frame: &InputFrame) -> Vec3 {
        let mut next = position + self.move_delta(speed, frame);
        for action in &frame.actions {
            next += self.action_delta(action);
        }
        next
    }
}

/// A point body moved by a [`MovementModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedBody {
    position: Vec3,
    model: MovementModel,
}

impl PredictedBody {
    pub fn new(position: Vec3, model: MovementModel) -> Self {
        Self { position, model }
    }

    /// Move without going through the input pipeline.
    pub fn displace(&mut self, offset: Vec3) {
        self.position += offset;
    }

    pub fn model(&self) -> &MovementModel {
        &self.model
    }
}

impl PredictedEntity for PredictedBody {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    fn move_delta(&self, speed: f64, frame: &InputFrame) -> Vec3 {
        self.model.move_delta(speed, frame)
    }

    fn action_delta(&self, action: &ActionFrame) -> Vec3 {
        self.model.action_delta(action)
    }

    fn follow_up(&self, action: &ActionFrame) -> Option<ActionFrame> {
        self.model.follow_up(action)
    }
}
