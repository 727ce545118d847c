//! Correlated request handles.
//!
//! Every directory request returns a [`ServiceCallback`]. Requests rejected by
//! a precondition come back already resolved; the rest resolve later, exactly
//! once, through either a matching reply or the pending-callback timeout.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use scenegrid_util::{Observers, Seconds, SubscriptionId};
use scenegrid_wire::{CallbackId, CallbackState, NodeId};

/// Event payload delivered to response and timeout handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub callback_id: CallbackId,
    pub state: CallbackState,
    pub data: Option<T>,
    pub response_time: Seconds,
}

struct CallbackCore<T> {
    callback_id: CallbackId,
    source_node_id: NodeId,
    state: CallbackState,
    request_time: Seconds,
    response_time: Option<Seconds>,
    data: Option<T>,
    on_response: Observers<Response<T>>,
    on_timeout: Observers<Response<T>>,
}

/// Shared handle to one directory request.
///
/// Clones refer to the same request. Handlers subscribed after the request
/// resolved never run; inspect [`ServiceCallback::state`] instead.
pub struct ServiceCallback<T> {
    core: Rc<RefCell<CallbackCore<T>>>,
}

impl<T> Clone for ServiceCallback<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for ServiceCallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("ServiceCallback")
            .field("callback_id", &core.callback_id)
            .field("source_node_id", &core.source_node_id)
            .field("state", &core.state)
            .finish()
    }
}

impl<T: Clone> ServiceCallback<T> {
    fn with_state(
        callback_id: CallbackId,
        source_node_id: NodeId,
        state: CallbackState,
        request_time: Seconds,
    ) -> Self {
        Self {
            core: Rc::new(RefCell::new(CallbackCore {
                callback_id,
                source_node_id,
                state,
                request_time,
                response_time: None,
                data: None,
                on_response: Observers::new(),
                on_timeout: Observers::new(),
            })),
        }
    }

    /// A request registered as pending under `callback_id`.
    pub(crate) fn awaiting(callback_id: CallbackId, source_node_id: NodeId, now: Seconds) -> Self {
        Self::with_state(
            callback_id,
            source_node_id,
            CallbackState::AwaitingResponse,
            now,
        )
    }

    /// A request answered locally without a round trip.
    pub(crate) fn completed(source_node_id: NodeId, now: Seconds, data: Option<T>) -> Self {
        let callback = Self::with_state(0, source_node_id, CallbackState::ResponseSuccess, now);
        {
            let mut core = callback.core.borrow_mut();
            core.response_time = Some(now);
            core.data = data;
        }
        callback
    }

    /// A request refused before any I/O.
    pub(crate) fn rejected(source_node_id: NodeId, now: Seconds, state: CallbackState) -> Self {
        Self::with_state(0, source_node_id, state, now)
    }

    /// Correlation id; 0 for requests that were never sent as pending.
    pub fn id(&self) -> CallbackId {
        self.core.borrow().callback_id
    }

    pub fn state(&self) -> CallbackState {
        self.core.borrow().state
    }

    pub fn source_node_id(&self) -> NodeId {
        self.core.borrow().source_node_id
    }

    pub fn request_time(&self) -> Seconds {
        self.core.borrow().request_time
    }

    pub fn response_time(&self) -> Option<Seconds> {
        self.core.borrow().response_time
    }

    pub fn response_data(&self) -> Option<T> {
        self.core.borrow().data.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    /// Run `handler` when a reply resolves this request.
    pub fn on_response(&self, handler: impl FnMut(&Response<T>) + 'static) -> SubscriptionId {
        self.core.borrow_mut().on_response.subscribe(handler)
    }

    /// Run `handler` when this request times out.
    pub fn on_timeout(&self, handler: impl FnMut(&Response<T>) + 'static) -> SubscriptionId {
        self.core.borrow_mut().on_timeout.subscribe(handler)
    }

    pub fn unsubscribe_response(&self, id: SubscriptionId) -> bool {
        self.core.borrow_mut().on_response.unsubscribe(id)
    }

    pub fn unsubscribe_timeout(&self, id: SubscriptionId) -> bool {
        self.core.borrow_mut().on_timeout.unsubscribe(id)
    }

    /// Resolve with a reply. Returns false if already resolved.
    pub(crate) fn resolve(&self, state: CallbackState, data: Option<T>, now: Seconds) -> bool {
        self.finish(state, data, now, false)
    }

    /// Resolve as [`CallbackState::ErrorTimeout`]. Returns false if already
    /// resolved.
    pub(crate) fn time_out(&self, now: Seconds) -> bool {
        self.finish(CallbackState::ErrorTimeout, None, now, true)
    }

    fn finish(&self, state: CallbackState, data: Option<T>, now: Seconds, timed_out: bool) -> bool {
        // Handlers run after the borrow ends so they may query this handle.
        let (mut handlers, response) = {
            let mut core = self.core.borrow_mut();
            if core.state != CallbackState::AwaitingResponse {
                return false;
            }

            core.state = state;
            core.response_time = Some(now);
            core.data = data.clone();

            let response = std::mem::take(&mut core.on_response);
            let timeout = std::mem::take(&mut core.on_timeout);
            let handlers = if timed_out { timeout } else { response };
            (
                handlers,
                Response {
                    callback_id: core.callback_id,
                    state,
                    data,
                    response_time: now,
                },
            )
        };

        handlers.emit(&response);
        true
    }
}
