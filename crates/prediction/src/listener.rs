//! Per-entity input buffer with prediction and reconciliation.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, trace};
use scenegrid_sim::{ActionFrame, ActionId, Frame, InputFrame, InputHistoryItem, Vec3};
use scenegrid_util::{Observers, SubscriptionId};

use crate::PredictionConfig;
use crate::entity::PredictedEntity;

/// A correction applied by [`InputListener::reconcile_frames`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Frame at which the local and authoritative positions diverged.
    pub frame: Frame,
    pub distance: f64,
    /// Entity position after replaying from the authoritative position.
    pub corrected: Vec3,
}

/// Outcome of offering an authority history batch.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryBatch {
    /// Queued for the next reconciliation.
    Accepted { items: usize },
    /// Dropped: batch carried no items.
    DroppedEmpty,
    /// Dropped: newest frame is not newer than what was already accepted.
    DroppedStale { last: Frame, latest: Frame },
}

impl HistoryBatch {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Records, plays and reconciles the input frames of one entity.
///
/// History items store the position the frame was played *from*, so the
/// trajectory after frame `F` is the replay of every frame `>= F` from the
/// position stored at `F`.
pub struct InputListener {
    config: PredictionConfig,
    current_frame: Frame,
    /// Last frame reconciled against the authority.
    authoritative_frame: Frame,
    pending: InputFrame,
    current_actions: BTreeMap<ActionId, ActionFrame>,
    frames_to_play: VecDeque<InputFrame>,
    frames_to_send: Vec<InputFrame>,
    local_history: Vec<InputHistoryItem>,
    authority_history: VecDeque<InputHistoryItem>,
    on_reconcile: Observers<Reconciliation>,
}

impl InputListener {
    pub fn new(config: PredictionConfig) -> Self {
        Self {
            config,
            current_frame: 0,
            authoritative_frame: 0,
            pending: InputFrame::default(),
            current_actions: BTreeMap::new(),
            frames_to_play: VecDeque::new(),
            frames_to_send: Vec::new(),
            local_history: Vec::new(),
            authority_history: VecDeque::new(),
            on_reconcile: Observers::new(),
        }
    }

    // ========================================================================
    // Record / Advance / Save
    // ========================================================================

    /// Set the movement axes of the pending frame. They persist until changed.
    pub fn record_movement(&mut self, horizontal: f64, vertical: f64) {
        self.pending.horizontal = horizontal;
        self.pending.vertical = vertical;
    }

    /// Record an action for the pending frame, replacing any earlier action
    /// with the same id.
    pub fn record_action(&mut self, action: ActionFrame) {
        self.current_actions.insert(action.action_id, action);
    }

    pub fn advance_frame(&mut self) {
        self.current_frame = self.current_frame.saturating_add(1);
        self.pending.frame = self.current_frame;
    }

    /// Queue the pending frame to play and to send.
    pub fn save_frame(&mut self) {
        let mut frame = self.pending.clone();
        frame.actions = std::mem::take(&mut self.current_actions)
            .into_values()
            .collect();

        self.frames_to_send.push(frame.clone());
        self.frames_to_play.push_back(frame);
    }

    // ========================================================================
    // Play
    // ========================================================================

    /// Apply the oldest queued frame to `entity`.
    ///
    /// Continuing actions are recorded again for the next frame. Returns true
    /// when a frame was played on a sync tick.
    pub fn play_frame<E: PredictedEntity + ?Sized>(&mut self, entity: &mut E) -> bool {
        let Some(frame) = self.frames_to_play.pop_front() else {
            return false;
        };

        let from = entity.position();
        entity.set_position(entity.advance(from, self.config.speed, &frame));
        for action in &frame.actions {
            if let Some(next) = entity.follow_up(action) {
                self.record_action(next);
            }
        }

        trace!("played frame {} from {:?}", frame.frame, from);
        self.local_history.push(InputHistoryItem {
            position: from,
            input: frame,
        });

        self.current_frame % self.config.frame_sync_rate.max(1) == 0
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    /// Compare queued authority history with the local history and correct
    /// `entity` where they diverge. Returns the number of corrections.
    ///
    /// Authority items without an exact local match are skipped.
    pub fn reconcile_frames<E: PredictedEntity + ?Sized>(&mut self, entity: &mut E) -> usize {
        self.clear_local_history(self.authoritative_frame);

        let mut corrections = 0;
        while let Some(authority) = self.authority_history.pop_front() {
            let frame = authority.frame();
            let Some(index) = self
                .local_history
                .iter()
                .position(|item| item.frame() == frame)
            else {
                continue;
            };

            let distance = self.local_history[index]
                .position
                .distance(authority.position);
            if distance > self.config.reconcile_distance {
                let corrected = self.replay_from(index, authority.position, entity);
                entity.set_position(corrected);
                corrections += 1;

                debug!(
                    "reconciled frame {}: distance={:.3} corrected={:?}",
                    frame, distance, corrected
                );
                self.on_reconcile.emit(&Reconciliation {
                    frame,
                    distance,
                    corrected,
                });
            }
            self.authoritative_frame = frame;
        }
        corrections
    }

    /// Replay local history from `index` starting at `position`, rewriting
    /// the stored positions. Returns the final position.
    fn replay_from<E: PredictedEntity + ?Sized>(
        &mut self,
        index: usize,
        mut position: Vec3,
        entity: &E,
    ) -> Vec3 {
        let speed = self.config.speed;
        for item in &mut self.local_history[index..] {
            item.position = position;
            position = entity.advance(position, speed, &item.input);
        }
        position
    }

    /// Drop local history up to and including `until`.
    pub fn clear_local_history(&mut self, until: Frame) {
        let count = self
            .local_history
            .iter()
            .take_while(|item| item.frame() <= until)
            .count();
        self.local_history.drain(..count);
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Saved frames not yet sent to the authority.
    pub fn take_frames_to_send(&mut self) -> Vec<InputFrame> {
        std::mem::take(&mut self.frames_to_send)
    }

    /// Played history, handed to the owner by the authority.
    pub fn take_local_history(&mut self) -> Vec<InputHistoryItem> {
        std::mem::take(&mut self.local_history)
    }

    /// Queue frames received from the owner.
    pub fn add_frames_to_play(&mut self, frames: impl IntoIterator<Item = InputFrame>) {
        self.frames_to_play.extend(frames);
    }

    /// Queue an authority history batch, oldest first.
    ///
    /// A batch whose newest frame is not newer than the last reconciled or
    /// queued frame arrived out of order and is dropped whole.
    pub fn add_authority_history(&mut self, items: Vec<InputHistoryItem>) -> HistoryBatch {
        let Some(last) = items.last().map(InputHistoryItem::frame) else {
            return HistoryBatch::DroppedEmpty;
        };

        let latest = self
            .authority_history
            .back()
            .map_or(self.authoritative_frame, |item| {
                item.frame().max(self.authoritative_frame)
            });
        if last <= latest {
            return HistoryBatch::DroppedStale { last, latest };
        }

        let count = items.len();
        self.authority_history.extend(items);
        HistoryBatch::Accepted { items: count }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub fn on_reconcile(&mut self, handler: impl FnMut(&Reconciliation) + 'static) -> SubscriptionId {
        self.on_reconcile.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.on_reconcile.unsubscribe(id)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub fn authoritative_frame(&self) -> Frame {
        self.authoritative_frame
    }

    pub fn pending_frame(&self) -> &InputFrame {
        &self.pending
    }

    pub fn current_actions(&self) -> impl Iterator<Item = &ActionFrame> {
        self.current_actions.values()
    }

    pub fn frames_to_play(&self) -> usize {
        self.frames_to_play.len()
    }

    pub fn frames_to_send(&self) -> &[InputFrame] {
        &self.frames_to_send
    }

    pub fn local_history(&self) -> &[InputHistoryItem] {
        &self.local_history
    }

    pub fn authority_history(&self) -> usize {
        self.authority_history.len()
    }
}

impl Default for InputListener {
    fn default() -> Self {
        Self::new(PredictionConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
