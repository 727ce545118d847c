//! Binds an [`InputListener`] to a transport and a simulated entity.

use log::{debug, warn};
use scenegrid_sim::ActionFrame;
use scenegrid_wire::{
    Channel, EntityId, Envelope, InputFramesProto, InputHistoryProto, MessageKind, PeerId, Target,
    Transport, WireError,
};
use thiserror::Error;

use crate::entity::PredictedEntity;
use crate::listener::{HistoryBatch, InputListener};

/// Part a process plays for one networked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Controlling client: records, predicts and reconciles.
    Owner,
    /// Authority: plays the owner's frames and reports its history back.
    Authority { owner: PeerId },
    /// Any other process. No prediction runs.
    Observer,
}

/// Failure to accept a received prediction message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("envelope for entity {got} delivered to entity {expected}")]
    WrongEntity { expected: EntityId, got: EntityId },

    #[error("{kind:?} not accepted in role {role:?}")]
    WrongRole { kind: MessageKind, role: Role },

    #[error("inputs for entity {entity_id} from peer {from}, owner is {owner}")]
    NotOwner {
        entity_id: EntityId,
        from: PeerId,
        owner: PeerId,
    },
}

/// One predicted entity as seen by one process.
pub struct NetworkedEntity<E> {
    entity_id: EntityId,
    role: Role,
    listener: InputListener,
    entity: E,
}

impl<E: PredictedEntity> NetworkedEntity<E> {
    pub fn new(entity_id: EntityId, role: Role, listener: InputListener, entity: E) -> Self {
        Self {
            entity_id,
            role,
            listener,
            entity,
        }
    }

    /// Capture input for the next tick. Ignored unless this process owns
    /// the entity.
    pub fn record_movement(&mut self, horizontal: f64, vertical: f64) {
        if self.role == Role::Owner {
            self.listener.record_movement(horizontal, vertical);
        }
    }

    pub fn record_action(&mut self, action: ActionFrame) {
        if self.role == Role::Owner {
            self.listener.record_action(action);
        }
    }

    /// One fixed simulation tick: advance, save (owner), play, sync on the
    /// sync cadence, reconcile (owner).
    pub fn fixed_update<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.role == Role::Observer {
            return;
        }

        self.listener.advance_frame();
        if self.role == Role::Owner {
            self.listener.save_frame();
        }
        if self.listener.play_frame(&mut self.entity) {
            self.sync(transport);
        }
        if self.role == Role::Owner {
            self.listener.reconcile_frames(&mut self.entity);
        }
    }

    fn sync<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        match self.role {
            Role::Owner => {
                let frames = self.listener.take_frames_to_send();
                if frames.is_empty() {
                    return;
                }
                let body = InputFramesProto::from_frames(&frames);
                let envelope = Envelope::new(MessageKind::SyncInputs, self.entity_id, &body);
                transport.send(Target::Server, Channel::Reliable, envelope.to_bytes());
            }
            Role::Authority { owner } => {
                let history = self.listener.take_local_history();
                if history.is_empty() {
                    return;
                }
                let body = InputHistoryProto::from_items(&history);
                let envelope =
                    Envelope::new(MessageKind::SyncInputHistory, self.entity_id, &body);
                transport.send(Target::Player(owner), Channel::Unreliable, envelope.to_bytes());
            }
            Role::Observer => {}
        }
    }

    /// Accept a prediction envelope addressed to this entity.
    pub fn receive(&mut self, from: PeerId, envelope: &Envelope) -> Result<(), PredictionError> {
        if envelope.entity_id != self.entity_id {
            return Err(PredictionError::WrongEntity {
                expected: self.entity_id,
                got: envelope.entity_id,
            });
        }

        let kind = envelope.message_kind()?;
        match (kind, self.role) {
            (MessageKind::SyncInputs, Role::Authority { owner }) => {
                if from != owner {
                    return Err(PredictionError::NotOwner {
                        entity_id: self.entity_id,
                        from,
                        owner,
                    });
                }
                let frames = envelope.decode_payload::<InputFramesProto>()?.into_frames()?;
                debug!(
                    "entity {}: queued {} frames from owner",
                    self.entity_id,
                    frames.len()
                );
                self.listener.add_frames_to_play(frames);
            }
            (MessageKind::SyncInputHistory, Role::Owner) => {
                let items = envelope.decode_payload::<InputHistoryProto>()?.into_items()?;
                match self.listener.add_authority_history(items) {
                    HistoryBatch::Accepted { .. } => {}
                    HistoryBatch::DroppedEmpty => {
                        debug!("entity {}: empty history batch", self.entity_id)
                    }
                    HistoryBatch::DroppedStale { last, latest } => warn!(
                        "entity {}: stale history batch (last={}, latest={})",
                        self.entity_id, last, latest
                    ),
                }
            }
            (kind, role) => return Err(PredictionError::WrongRole { kind, role }),
        }
        Ok(())
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn listener(&self) -> &InputListener {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut InputListener {
        &mut self.listener
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }
}
