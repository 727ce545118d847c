//! The node directory service.
//!
//! Every request follows one shape:
//! 1. Caller side: precondition checks (`ErrorNoData`, then
//!    `ErrorServiceNotInitialized`, then `ErrorNoConnection`), then the
//!    request is tracked as pending if it expects a reply and sent to the
//!    authority.
//! 2. Authority side: registry mutation or lookup, or a relay to the target
//!    node. An unknown target is answered with `ResponseFailed` at once.
//! 3. Resolution: the reply is matched by callback id and resolves the
//!    pending callback, or the pending entry expires and resolves it as
//!    `ErrorTimeout`. Never both.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, error, info, trace, warn};
use prost::Message;
use scenegrid_util::{ExpiringMap, IdPool, Seconds, SharedClock};
use scenegrid_wire::{
    CallbackId, CallbackState, Channel, CreateSceneInNodeProto, Envelope, Incoming,
    InstantiateInNodeProto, MessageKind, NodeId, NodeSceneTemplateProto, PeerId, SceneNameProto,
    SceneTemplateProto, ServiceCallbackProto, Target, Transport, WireError,
};
use thiserror::Error;

use crate::callback::ServiceCallback;
use crate::host::{CreateSceneRequest, InstantiateRequest, SceneHost};
use crate::node::{Node, NodeSceneTemplate, SceneSettings, SceneTemplate};
use crate::{DirectoryConfig, ExpiryScan};

/// Failure to process a received directory message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{0:?} is not handled by the directory")]
    UnexpectedKind(MessageKind),

    #[error("{0:?} is only handled by the authority")]
    AuthorityOnly(MessageKind),
}

/// Service lifecycle. Requests are accepted only while `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Running,
    TornDown,
}

/// An in-flight request, by the reply it expects.
enum PendingCallback {
    Confirm(ServiceCallback<()>),
    Lookup(ServiceCallback<NodeSceneTemplate>),
    CreateScene(ServiceCallback<SceneTemplate>),
}

impl PendingCallback {
    fn accepts(&self, kind: MessageKind) -> bool {
        match self {
            Self::Confirm(_) => matches!(
                kind,
                MessageKind::ConfirmScene | MessageKind::ConfirmInstantiateInNode
            ),
            Self::Lookup(_) => kind == MessageKind::ReceiveLookupScene,
            Self::CreateScene(_) => kind == MessageKind::ConfirmCreateSceneInNode,
        }
    }

    fn time_out(&self, now: Seconds) -> bool {
        match self {
            Self::Confirm(callback) => callback.time_out(now),
            Self::Lookup(callback) => callback.time_out(now),
            Self::CreateScene(callback) => callback.time_out(now),
        }
    }
}

fn decode_data<M: Message + Default>(data: &[u8]) -> Result<M, WireError> {
    Ok(M::decode(data)?)
}

/// Reply states other than terminal ones are treated as failures.
fn reply_state(request: &ServiceCallbackProto) -> CallbackState {
    let state = request.state();
    if state.is_terminal() {
        state
    } else {
        CallbackState::ResponseFailed
    }
}

fn handled_by_authority(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::RegisterNode
            | MessageKind::RegisterScene
            | MessageKind::UnregisterScene
            | MessageKind::LookupScene
            | MessageKind::RelayInstantiateInNode
            | MessageKind::RelayConfirmInstantiateInNode
            | MessageKind::RelayCreateSceneInNode
            | MessageKind::RelayConfirmCreateSceneInNode
    )
}

/// Directory endpoint of one node process.
///
/// On the authority node the same instance also holds the registry and
/// serves every other node.
pub struct NodeService<T: Transport> {
    config: DirectoryConfig,
    node_id: NodeId,
    is_authority: bool,
    authority_settings: SceneSettings,
    clock: SharedClock,
    transport: T,
    lifecycle: Lifecycle,
    callback_ids: IdPool<CallbackId>,
    pending: ExpiringMap<CallbackId, PendingCallback>,
    scenes_cached: ExpiringMap<String, NodeSceneTemplate>,
    /// Authority only: node -> scene name -> entry.
    scenes_registered: BTreeMap<NodeId, BTreeMap<String, NodeSceneTemplate>>,
    /// Authority only: connection handle of every registered node.
    node_peers: BTreeMap<NodeId, PeerId>,
    /// Messages the authority addressed to itself.
    loopback: VecDeque<Incoming>,
}

impl<T: Transport> NodeService<T> {
    pub fn new(config: DirectoryConfig, node: &Node, clock: SharedClock, transport: T) -> Self {
        let callback_ids = IdPool::new(1, config.max_callback_id.max(1), false);
        let pending = ExpiringMap::new(clock.clone(), config.pending_callback_lifetime);
        let scenes_cached = ExpiringMap::new(clock.clone(), config.scene_cache_lifetime);

        Self {
            config,
            node_id: node.node_id,
            is_authority: node.is_authority,
            authority_settings: node.authority_settings.clone(),
            clock,
            transport,
            lifecycle: Lifecycle::Uninitialized,
            callback_ids,
            pending,
            scenes_cached,
            scenes_registered: BTreeMap::new(),
            node_peers: BTreeMap::new(),
            loopback: VecDeque::new(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start serving and register this node with the authority.
    pub fn start(&mut self) -> CallbackState {
        match self.lifecycle {
            Lifecycle::Running => return CallbackState::ResponseSuccess,
            Lifecycle::TornDown => return CallbackState::ErrorServiceNotInitialized,
            Lifecycle::Uninitialized => {}
        }
        if !self.transport.is_connected() {
            return CallbackState::ErrorNoConnection;
        }

        self.lifecycle = Lifecycle::Running;
        if self.is_authority {
            self.node_peers
                .insert(self.node_id, self.transport.local_peer());
        } else {
            let request = ServiceCallbackProto {
                callback_id: 0,
                source_node_id: self.node_id,
                state: CallbackState::None as i32,
                data: Vec::new(),
                require_confirmation: false,
            };
            self.send_to_authority(MessageKind::RegisterNode, &request);
        }

        info!(
            "node service started: node={} authority={}",
            self.node_id, self.is_authority
        );
        CallbackState::ResponseSuccess
    }

    /// Stop serving. Every pending request resolves as `ErrorTimeout`.
    pub fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::TornDown {
            return;
        }

        self.lifecycle = Lifecycle::TornDown;
        self.loopback.clear();
        self.scenes_cached.clear();
        self.callback_ids.clear();

        let now = self.clock.now();
        let pending = self.pending.drain();
        let count = pending.len();
        for (_, item) in pending {
            item.value.time_out(now);
        }
        info!(
            "node service torn down: node={} timed_out={}",
            self.node_id, count
        );
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn precheck(&self, has_data: bool) -> Result<(), CallbackState> {
        if !has_data {
            return Err(CallbackState::ErrorNoData);
        }
        if self.lifecycle != Lifecycle::Running {
            return Err(CallbackState::ErrorServiceNotInitialized);
        }
        if !self.transport.is_connected() {
            return Err(CallbackState::ErrorNoConnection);
        }
        Ok(())
    }

    /// Track a new pending request. `None` if the id pool is exhausted.
    fn await_response<R: Clone>(
        &mut self,
        now: Seconds,
        wrap: fn(ServiceCallback<R>) -> PendingCallback,
    ) -> Option<ServiceCallback<R>> {
        let Some(callback_id) = self.callback_ids.get_next() else {
            error!(
                "callback id pool exhausted on node {} ({} pending)",
                self.node_id,
                self.pending.len()
            );
            return None;
        };

        let callback = ServiceCallback::awaiting(callback_id, self.node_id, now);
        self.pending.insert(callback_id, wrap(callback.clone()));
        Some(callback)
    }

    fn send_request<M: Message>(
        &mut self,
        kind: MessageKind,
        callback_id: CallbackId,
        require_confirmation: bool,
        body: &M,
    ) {
        let request = ServiceCallbackProto {
            callback_id,
            source_node_id: self.node_id,
            state: CallbackState::AwaitingResponse as i32,
            data: body.encode_to_vec(),
            require_confirmation,
        };
        self.send_to_authority(kind, &request);
    }

    /// Register `template` as hosted by this node.
    ///
    /// Without confirmation the request is fire-and-forget and the returned
    /// callback is already `ResponseSuccess`.
    pub fn register_scene(
        &mut self,
        template: &SceneTemplate,
        require_confirmation: bool,
    ) -> ServiceCallback<()> {
        let now = self.clock.now();
        if let Err(state) = self.precheck(!template.scene_name.is_empty()) {
            return ServiceCallback::rejected(self.node_id, now, state);
        }

        let body = NodeSceneTemplateProto::from(&NodeSceneTemplate {
            node_id: self.node_id,
            template: template.clone(),
        });
        self.confirmable_request(MessageKind::RegisterScene, require_confirmation, &body, now)
    }

    /// Remove this node's registration of `scene_name`.
    pub fn unregister_scene(
        &mut self,
        scene_name: &str,
        require_confirmation: bool,
    ) -> ServiceCallback<()> {
        let now = self.clock.now();
        if let Err(state) = self.precheck(!scene_name.is_empty()) {
            return ServiceCallback::rejected(self.node_id, now, state);
        }

        let body = SceneNameProto {
            scene_name: scene_name.to_string(),
        };
        self.confirmable_request(
            MessageKind::UnregisterScene,
            require_confirmation,
            &body,
            now,
        )
    }

    fn confirmable_request<M: Message>(
        &mut self,
        kind: MessageKind,
        require_confirmation: bool,
        body: &M,
        now: Seconds,
    ) -> ServiceCallback<()> {
        if !require_confirmation {
            self.send_request(kind, 0, false, body);
            return ServiceCallback::completed(self.node_id, now, Some(()));
        }

        let Some(callback) = self.await_response(now, PendingCallback::Confirm) else {
            return ServiceCallback::rejected(self.node_id, now, CallbackState::ResponseFailed);
        };
        self.send_request(kind, callback.id(), true, body);
        callback
    }

    /// Find the node hosting `scene_name`.
    ///
    /// A cached answer resolves synchronously as `ResponseSuccess`.
    pub fn lookup_scene(&mut self, scene_name: &str) -> ServiceCallback<NodeSceneTemplate> {
        let now = self.clock.now();
        if let Err(state) = self.precheck(!scene_name.is_empty()) {
            return ServiceCallback::rejected(self.node_id, now, state);
        }

        if self.config.enable_lookup_caching {
            if let Some(hit) = self.scenes_cached.get(&scene_name.to_string()) {
                trace!("lookup cache hit: scene={}", scene_name);
                return ServiceCallback::completed(self.node_id, now, Some(hit.clone()));
            }
        }

        let Some(callback) = self.await_response(now, PendingCallback::Lookup) else {
            return ServiceCallback::rejected(self.node_id, now, CallbackState::ResponseFailed);
        };
        let body = SceneNameProto {
            scene_name: scene_name.to_string(),
        };
        self.send_request(MessageKind::LookupScene, callback.id(), true, &body);
        callback
    }

    /// Spawn an entity in a scene on another node (or this one).
    pub fn instantiate_in_node(&mut self, request: &InstantiateRequest) -> ServiceCallback<()> {
        let now = self.clock.now();
        let has_data = request.target_node_id != 0 && !request.scene_name.is_empty();
        if let Err(state) = self.precheck(has_data) {
            return ServiceCallback::rejected(self.node_id, now, state);
        }

        let Some(callback) = self.await_response(now, PendingCallback::Confirm) else {
            return ServiceCallback::rejected(self.node_id, now, CallbackState::ResponseFailed);
        };
        let body = InstantiateInNodeProto::from(request);
        self.send_request(
            MessageKind::RelayInstantiateInNode,
            callback.id(),
            true,
            &body,
        );
        callback
    }

    /// Create a dynamic scene on another node (or this one).
    ///
    /// On success the response carries the template as created, with any
    /// auto-assigned addresses filled in.
    pub fn create_scene_in_node(
        &mut self,
        request: &CreateSceneRequest,
    ) -> ServiceCallback<SceneTemplate> {
        let now = self.clock.now();
        let has_data = request.target_node_id != 0 && !request.template.scene_name.is_empty();
        if let Err(state) = self.precheck(has_data) {
            return ServiceCallback::rejected(self.node_id, now, state);
        }

        let Some(callback) = self.await_response(now, PendingCallback::CreateScene) else {
            return ServiceCallback::rejected(self.node_id, now, CallbackState::ResponseFailed);
        };
        let body = CreateSceneInNodeProto::from(request);
        self.send_request(
            MessageKind::RelayCreateSceneInNode,
            callback.id(),
            true,
            &body,
        );
        callback
    }

    // ========================================================================
    // Per-Tick Driving
    // ========================================================================

    /// Drain the transport, dispatching directory messages.
    ///
    /// Returns the envelopes of other subsystems with their sender.
    pub fn poll<H: SceneHost + ?Sized>(&mut self, host: &mut H) -> Vec<(PeerId, Envelope)> {
        let mut passthrough = Vec::new();
        while let Some(incoming) = self.transport.receive() {
            let from = incoming.from;
            match self.handle(incoming, host) {
                Ok(Some(envelope)) => passthrough.push((from, envelope)),
                Ok(None) => {}
                Err(err) => warn!("dropped message from peer {}: {}", from, err),
            }
        }
        passthrough
    }

    /// Deliver loopback messages, then expire pending requests and cached
    /// lookups.
    pub fn update<H: SceneHost + ?Sized>(&mut self, host: &mut H) {
        while let Some(incoming) = self.loopback.pop_front() {
            if let Err(err) = self.handle(incoming, host) {
                warn!("dropped loopback message: {}", err);
            }
        }

        self.expire_pending();
        self.expire_cached();
    }

    fn expire_pending(&mut self) {
        let expired = match self.config.expiry_scan {
            ExpiryScan::Full => self.pending.update(),
            ExpiryScan::Incremental => self.pending.step().into_iter().collect(),
        };
        if expired.is_empty() {
            return;
        }

        let now = self.clock.now();
        for callback_id in expired {
            if let Some(pending) = self.release_pending(callback_id) {
                debug!("request {} timed out", callback_id);
                pending.time_out(now);
            }
        }
    }

    fn expire_cached(&mut self) {
        let expired = match self.config.expiry_scan {
            ExpiryScan::Full => self.scenes_cached.update(),
            ExpiryScan::Incremental => self.scenes_cached.step().into_iter().collect(),
        };
        for scene_name in expired {
            trace!("lookup cache entry expired: scene={}", scene_name);
            self.scenes_cached.remove(&scene_name);
        }
    }

    /// Authority only: forget a node whose connection dropped, together with
    /// every scene it registered. Returns the node's id.
    pub fn handle_peer_disconnected(&mut self, peer: PeerId) -> Option<NodeId> {
        let node_id = self
            .node_peers
            .iter()
            .find(|(_, p)| **p == peer)
            .map(|(node_id, _)| *node_id)?;

        self.node_peers.remove(&node_id);
        let removed = self
            .scenes_registered
            .remove(&node_id)
            .map_or(0, |scenes| scenes.len());
        info!(
            "node {} disconnected, dropped {} registered scenes",
            node_id, removed
        );
        Some(node_id)
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Decode and dispatch one received payload.
    ///
    /// Non-directory envelopes are returned untouched.
    pub fn handle<H: SceneHost + ?Sized>(
        &mut self,
        incoming: Incoming,
        host: &mut H,
    ) -> Result<Option<Envelope>, DirectoryError> {
        let envelope = Envelope::from_bytes(&incoming.payload)?;
        let kind = envelope.message_kind()?;
        if !kind.is_directory() {
            return Ok(Some(envelope));
        }
        if self.lifecycle != Lifecycle::Running {
            debug!("ignoring {:?} while {:?}", kind, self.lifecycle);
            return Ok(None);
        }
        if handled_by_authority(kind) && !self.is_authority {
            return Err(DirectoryError::AuthorityOnly(kind));
        }

        let request: ServiceCallbackProto = envelope.decode_payload()?;
        let from = incoming.from;
        match kind {
            MessageKind::RegisterNode => self.on_register_node(from, &request),
            MessageKind::RegisterScene => self.on_register_scene(from, request)?,
            MessageKind::UnregisterScene => self.on_unregister_scene(from, request)?,
            MessageKind::LookupScene => self.on_lookup_scene(from, request)?,
            MessageKind::RelayInstantiateInNode => self.on_relay_request(
                from,
                request,
                MessageKind::InstantiateInNode,
                MessageKind::ConfirmInstantiateInNode,
            )?,
            MessageKind::RelayCreateSceneInNode => self.on_relay_request(
                from,
                request,
                MessageKind::CreateSceneInNode,
                MessageKind::ConfirmCreateSceneInNode,
            )?,
            MessageKind::RelayConfirmInstantiateInNode => {
                self.on_relay_confirm(request, MessageKind::ConfirmInstantiateInNode)
            }
            MessageKind::RelayConfirmCreateSceneInNode => {
                self.on_relay_confirm(request, MessageKind::ConfirmCreateSceneInNode)
            }
            MessageKind::InstantiateInNode => self.on_instantiate_in_node(request, host)?,
            MessageKind::CreateSceneInNode => self.on_create_scene_in_node(request, host)?,
            MessageKind::ConfirmScene | MessageKind::ConfirmInstantiateInNode => {
                self.on_confirm(kind, &request)
            }
            MessageKind::ReceiveLookupScene => self.on_receive_lookup_scene(&request)?,
            MessageKind::ConfirmCreateSceneInNode => self.on_confirm_create_scene(&request)?,
            other => return Err(DirectoryError::UnexpectedKind(other)),
        }
        Ok(None)
    }

    fn on_register_node(&mut self, from: PeerId, request: &ServiceCallbackProto) {
        if self.node_peers.contains_key(&request.source_node_id) {
            return;
        }
        self.node_peers.insert(request.source_node_id, from);
        info!(
            "node {} registered from peer {}",
            request.source_node_id, from
        );
    }

    fn on_register_scene(
        &mut self,
        from: PeerId,
        request: ServiceCallbackProto,
    ) -> Result<(), DirectoryError> {
        let body: NodeSceneTemplateProto = decode_data(&request.data)?;
        let mut entry = NodeSceneTemplate::try_from(body)?;
        if !self.is_sender(from, request.source_node_id) {
            warn!(
                "peer {} registering {} as node {}: rejected",
                from, entry.template.scene_name, request.source_node_id
            );
            if request.require_confirmation {
                self.reply(from, MessageKind::ConfirmScene, request, false, Vec::new());
            }
            return Ok(());
        }
        entry.node_id = request.source_node_id;
        self.node_peers.entry(entry.node_id).or_insert(from);

        let success = self.add_registered_scene(entry);
        if request.require_confirmation {
            self.reply(from, MessageKind::ConfirmScene, request, success, Vec::new());
        }
        Ok(())
    }

    fn on_unregister_scene(
        &mut self,
        from: PeerId,
        request: ServiceCallbackProto,
    ) -> Result<(), DirectoryError> {
        let body: SceneNameProto = decode_data(&request.data)?;
        let success = if self.is_sender(from, request.source_node_id) {
            self.remove_registered_scene(request.source_node_id, &body.scene_name)
        } else {
            warn!(
                "peer {} unregistering {} as node {}: rejected",
                from, body.scene_name, request.source_node_id
            );
            false
        };
        if request.require_confirmation {
            self.reply(from, MessageKind::ConfirmScene, request, success, Vec::new());
        }
        Ok(())
    }

    /// Whether `from` may act as `node_id`: neither is bound to another
    /// node or peer.
    fn is_sender(&self, from: PeerId, node_id: NodeId) -> bool {
        let claimed = self
            .node_peers
            .get(&node_id)
            .is_none_or(|peer| *peer == from);
        let bound = self
            .node_peers
            .iter()
            .all(|(id, peer)| *peer != from || *id == node_id);
        claimed && bound
    }

    fn on_lookup_scene(
        &mut self,
        from: PeerId,
        request: ServiceCallbackProto,
    ) -> Result<(), DirectoryError> {
        let body: SceneNameProto = decode_data(&request.data)?;
        let (success, data) = match self.registered_scene(&body.scene_name) {
            Some(entry) => (true, NodeSceneTemplateProto::from(entry).encode_to_vec()),
            None => (false, NodeSceneTemplateProto::default().encode_to_vec()),
        };
        self.reply(from, MessageKind::ReceiveLookupScene, request, success, data);
        Ok(())
    }

    fn on_relay_request(
        &mut self,
        from: PeerId,
        request: ServiceCallbackProto,
        forward: MessageKind,
        fail: MessageKind,
    ) -> Result<(), DirectoryError> {
        let target_node_id = if forward == MessageKind::InstantiateInNode {
            decode_data::<InstantiateInNodeProto>(&request.data)?.target_node_id
        } else {
            decode_data::<CreateSceneInNodeProto>(&request.data)?.target_node_id
        };

        match self.node_peers.get(&target_node_id).copied() {
            Some(peer) => self.send_to_peer(peer, forward, &request),
            None => {
                debug!(
                    "relay {:?} from node {}: node {} unknown",
                    forward, request.source_node_id, target_node_id
                );
                self.reply(from, fail, request, false, Vec::new());
            }
        }
        Ok(())
    }

    fn on_relay_confirm(&mut self, request: ServiceCallbackProto, forward: MessageKind) {
        let Some(peer) = self.node_peers.get(&request.source_node_id).copied() else {
            warn!(
                "dropping {:?} for unknown node {}",
                forward, request.source_node_id
            );
            return;
        };
        self.send_to_peer(peer, forward, &request);
    }

    fn on_instantiate_in_node<H: SceneHost + ?Sized>(
        &mut self,
        mut request: ServiceCallbackProto,
        host: &mut H,
    ) -> Result<(), DirectoryError> {
        let body: InstantiateInNodeProto = decode_data(&request.data)?;
        let spawn = InstantiateRequest::from(body);
        let success = host.instantiate_in_scene(&spawn);
        debug!(
            "instantiate code={} in scene {}: {}",
            spawn.create_code, spawn.scene_name, success
        );

        request.set_state(if success {
            CallbackState::ResponseSuccess
        } else {
            CallbackState::ResponseFailed
        });
        request.data = Vec::new();
        self.send_to_authority(MessageKind::RelayConfirmInstantiateInNode, &request);
        Ok(())
    }

    fn on_create_scene_in_node<H: SceneHost + ?Sized>(
        &mut self,
        mut request: ServiceCallbackProto,
        host: &mut H,
    ) -> Result<(), DirectoryError> {
        let body: CreateSceneInNodeProto = decode_data(&request.data)?;
        let create = CreateSceneRequest::try_from(body)?;
        let created = self
            .assign_addresses(&create, &*host)
            .filter(|template| host.create_scene(template.clone(), &create.scene_meta_data));

        match &created {
            Some(template) => {
                debug!("created scene {} on request", template.scene_name);
                request.set_state(CallbackState::ResponseSuccess);
                request.data = SceneTemplateProto::from(template).encode_to_vec();
            }
            None => {
                debug!("failed to create scene {}", create.template.scene_name);
                request.set_state(CallbackState::ResponseFailed);
                request.data = Vec::new();
            }
        }
        self.send_to_authority(MessageKind::RelayConfirmCreateSceneInNode, &request);
        Ok(())
    }

    /// Apply the auto-assign flags. `None` if no dynamic port is free.
    fn assign_addresses<H: SceneHost + ?Sized>(
        &self,
        create: &CreateSceneRequest,
        host: &H,
    ) -> Option<SceneTemplate> {
        let mut template = create.template.clone();
        let settings = &mut template.settings;
        if create.auto_assign_ip {
            settings.server_address.ip = self.authority_settings.server_address.ip.clone();
            settings.client_address.ip = self.authority_settings.client_address.ip.clone();
        }
        if create.auto_assign_port {
            let port = host.peek_dynamic_port()?;
            settings.server_address.port = port;
            settings.client_address.port = port;
        }
        Some(template)
    }

    fn on_confirm(&mut self, kind: MessageKind, request: &ServiceCallbackProto) {
        let Some(PendingCallback::Confirm(callback)) = self.pending_for_reply(kind, request) else {
            return;
        };
        callback.resolve(reply_state(request), Some(()), self.clock.now());
    }

    fn on_receive_lookup_scene(
        &mut self,
        request: &ServiceCallbackProto,
    ) -> Result<(), DirectoryError> {
        let Some(PendingCallback::Lookup(callback)) =
            self.pending_for_reply(MessageKind::ReceiveLookupScene, request)
        else {
            return Ok(());
        };

        let now = self.clock.now();
        let state = reply_state(request);
        let entry = decode_data::<NodeSceneTemplateProto>(&request.data)
            .and_then(NodeSceneTemplate::try_from)
            .ok()
            .filter(|entry| entry.node_id != 0);

        match (state, entry) {
            (CallbackState::ResponseSuccess, Some(entry)) => {
                if self.config.enable_lookup_caching {
                    self.scenes_cached
                        .insert(entry.template.scene_name.clone(), entry.clone());
                }
                callback.resolve(state, Some(entry), now);
            }
            (CallbackState::ResponseSuccess, None) => {
                callback.resolve(CallbackState::ResponseFailed, None, now);
                return Err(WireError::MissingField("template").into());
            }
            (state, _) => {
                callback.resolve(state, None, now);
            }
        }
        Ok(())
    }

    fn on_confirm_create_scene(
        &mut self,
        request: &ServiceCallbackProto,
    ) -> Result<(), DirectoryError> {
        let Some(PendingCallback::CreateScene(callback)) =
            self.pending_for_reply(MessageKind::ConfirmCreateSceneInNode, request)
        else {
            return Ok(());
        };

        let now = self.clock.now();
        let state = reply_state(request);
        if !state.is_success() {
            callback.resolve(state, None, now);
            return Ok(());
        }

        match decode_data::<SceneTemplateProto>(&request.data).and_then(SceneTemplate::try_from) {
            Ok(template) => {
                callback.resolve(state, Some(template), now);
                Ok(())
            }
            Err(err) => {
                callback.resolve(CallbackState::ResponseFailed, None, now);
                Err(err.into())
            }
        }
    }

    /// Take the pending request a reply refers to.
    ///
    /// Late replies (already timed out) and replies of the wrong kind are
    /// dropped.
    fn pending_for_reply(
        &mut self,
        kind: MessageKind,
        request: &ServiceCallbackProto,
    ) -> Option<PendingCallback> {
        let callback_id = request.callback_id;
        let Some(pending) = self.pending.get(&callback_id) else {
            debug!("no pending request {}, {:?} dropped", callback_id, kind);
            return None;
        };
        if !pending.accepts(kind) {
            warn!("{:?} does not answer request {}", kind, callback_id);
            return None;
        }
        self.release_pending(callback_id)
    }

    fn release_pending(&mut self, callback_id: CallbackId) -> Option<PendingCallback> {
        self.callback_ids.free(callback_id);
        self.pending.remove(&callback_id).map(|item| item.value)
    }

    // ========================================================================
    // Registry (authority)
    // ========================================================================

    /// Same-node re-registration succeeds without a second entry; another
    /// node's live registration wins.
    fn add_registered_scene(&mut self, entry: NodeSceneTemplate) -> bool {
        let scene_name = entry.template.scene_name.clone();
        match self.registered_owner(&scene_name) {
            Some(owner) if owner == entry.node_id => true,
            Some(owner) => {
                debug!(
                    "scene {} already registered by node {}, rejecting node {}",
                    scene_name, owner, entry.node_id
                );
                false
            }
            None => {
                debug!("scene {} registered by node {}", scene_name, entry.node_id);
                self.scenes_registered
                    .entry(entry.node_id)
                    .or_default()
                    .insert(scene_name, entry);
                true
            }
        }
    }

    fn remove_registered_scene(&mut self, node_id: NodeId, scene_name: &str) -> bool {
        let Some(scenes) = self.scenes_registered.get_mut(&node_id) else {
            return false;
        };
        let removed = scenes.remove(scene_name).is_some();
        if scenes.is_empty() {
            self.scenes_registered.remove(&node_id);
        }
        if removed {
            debug!("scene {} unregistered by node {}", scene_name, node_id);
        }
        removed
    }

    /// Authority only: the live registration of `scene_name`.
    pub fn registered_scene(&self, scene_name: &str) -> Option<&NodeSceneTemplate> {
        self.scenes_registered
            .values()
            .find_map(|scenes| scenes.get(scene_name))
    }

    pub fn registered_owner(&self, scene_name: &str) -> Option<NodeId> {
        self.registered_scene(scene_name).map(|entry| entry.node_id)
    }

    /// Authority only: every scene registered by `node_id`.
    pub fn registered_scenes(&self, node_id: NodeId) -> impl Iterator<Item = &NodeSceneTemplate> {
        self.scenes_registered
            .get(&node_id)
            .into_iter()
            .flat_map(|scenes| scenes.values())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn reply(
        &mut self,
        peer: PeerId,
        kind: MessageKind,
        mut request: ServiceCallbackProto,
        success: bool,
        data: Vec<u8>,
    ) {
        request.set_state(if success {
            CallbackState::ResponseSuccess
        } else {
            CallbackState::ResponseFailed
        });
        request.data = data;
        self.send_to_peer(peer, kind, &request);
    }

    fn send_to_authority(&mut self, kind: MessageKind, request: &ServiceCallbackProto) {
        let payload = Envelope::new(kind, 0, request).to_bytes();
        if self.is_authority {
            self.loopback.push_back(Incoming {
                from: self.transport.local_peer(),
                payload,
            });
        } else {
            self.transport
                .send(Target::Server, Channel::Reliable, payload);
        }
    }

    fn send_to_peer(&mut self, peer: PeerId, kind: MessageKind, request: &ServiceCallbackProto) {
        let payload = Envelope::new(kind, 0, request).to_bytes();
        if peer == self.transport.local_peer() {
            self.loopback.push_back(Incoming {
                from: peer,
                payload,
            });
        } else {
            self.transport
                .send(Target::Player(peer), Channel::Reliable, payload);
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_authority(&self) -> bool {
        self.is_authority
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cached_lookup(&self, scene_name: &str) -> Option<&NodeSceneTemplate> {
        self.scenes_cached.get(&scene_name.to_string())
    }

    /// Authority only: connection handle of a registered node.
    pub fn node_peer(&self, node_id: NodeId) -> Option<PeerId> {
        self.node_peers.get(&node_id).copied()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    use scenegrid_util::ManualClock;

    use crate::node::{Endpoint, NodeMap};

    const MASTER: NodeId = 1;
    const WEST: NodeId = 2;
    const EAST: NodeId = 3;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // ------------------------------------------------------------------------
    // Test transport: every peer has an inbox, peer 1 is the authority.
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Hub {
        inboxes: HashMap<PeerId, VecDeque<Incoming>>,
    }

    struct HubTransport {
        peer: PeerId,
        authority: PeerId,
        connected: Rc<Cell<bool>>,
        hub: Rc<RefCell<Hub>>,
    }

    impl Transport for HubTransport {
        fn local_peer(&self) -> PeerId {
            self.peer
        }

        fn is_connected(&self) -> bool {
            self.connected.get()
        }

        fn send(&mut self, target: Target, _channel: Channel, payload: Vec<u8>) {
            let mut hub = self.hub.borrow_mut();
            let peers: Vec<PeerId> = match target {
                Target::Server => vec![self.authority],
                Target::Player(peer) => vec![peer],
                Target::All => hub
                    .inboxes
                    .keys()
                    .copied()
                    .filter(|p| *p != self.peer)
                    .collect(),
            };
            for peer in peers {
                hub.inboxes.entry(peer).or_default().push_back(Incoming {
                    from: self.peer,
                    payload: payload.clone(),
                });
            }
        }

        fn receive(&mut self) -> Option<Incoming> {
            self.hub
                .borrow_mut()
                .inboxes
                .get_mut(&self.peer)
                .and_then(VecDeque::pop_front)
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        spawned: Vec<InstantiateRequest>,
        created: Vec<SceneTemplate>,
        next_port: Option<u16>,
    }

    impl SceneHost for RecordingHost {
        fn instantiate_in_scene(&mut self, request: &InstantiateRequest) -> bool {
            if request.scene_name != "Arena" {
                return false;
            }
            self.spawned.push(request.clone());
            true
        }

        fn create_scene(&mut self, template: SceneTemplate, _meta_data: &[u8]) -> bool {
            self.created.push(template);
            true
        }

        fn peek_dynamic_port(&self) -> Option<u16> {
            self.next_port
        }
    }

    fn arena() -> SceneTemplate {
        SceneTemplate::new(2, "Arena", SceneSettings::bound_to("10.0.0.2", 40_001))
    }

    struct Cluster {
        clock: ManualClock,
        hub: Rc<RefCell<Hub>>,
        links: HashMap<NodeId, Rc<Cell<bool>>>,
        services: BTreeMap<NodeId, NodeService<HubTransport>>,
        hosts: BTreeMap<NodeId, RecordingHost>,
    }

    impl Cluster {
        fn new(config: DirectoryConfig) -> Self {
            init_logging();
            let master = SceneSettings::bound_to("192.168.1.10", 7000);
            let map = NodeMap::new([
                Node::new(MASTER, "master", true).with_authority_settings(master.clone()),
                Node::new(WEST, "west", false).with_authority_settings(master.clone()),
                Node::new(EAST, "east", false).with_authority_settings(master),
            ])
            .unwrap();

            let clock = ManualClock::new(0.0);
            let hub = Rc::new(RefCell::new(Hub::default()));
            let mut links = HashMap::new();
            let mut services = BTreeMap::new();
            let mut hosts = BTreeMap::new();
            for node in map.nodes() {
                let connected = Rc::new(Cell::new(true));
                let transport = HubTransport {
                    peer: PeerId::from(node.node_id),
                    authority: PeerId::from(MASTER),
                    connected: Rc::clone(&connected),
                    hub: Rc::clone(&hub),
                };
                let service = NodeService::new(config.clone(), node, clock.shared(), transport);
                links.insert(node.node_id, connected);
                services.insert(node.node_id, service);
                hosts.insert(node.node_id, RecordingHost::default());
            }

            Self {
                clock,
                hub,
                links,
                services,
                hosts,
            }
        }

        fn started() -> Self {
            let mut cluster = Self::new(DirectoryConfig::default());
            for service in cluster.services.values_mut() {
                assert_eq!(service.start(), CallbackState::ResponseSuccess);
            }
            cluster.pump();
            cluster
        }

        fn service(&mut self, node_id: NodeId) -> &mut NodeService<HubTransport> {
            self.services.get_mut(&node_id).unwrap()
        }

        fn tick_node(&mut self, node_id: NodeId) {
            let service = self.services.get_mut(&node_id).unwrap();
            let host = self.hosts.get_mut(&node_id).unwrap();
            let passthrough = service.poll(host);
            assert!(passthrough.is_empty());
            service.update(host);
        }

        /// Tick every node until no message is in flight.
        fn pump(&mut self) {
            for _ in 0..8 {
                for node_id in [MASTER, WEST, EAST] {
                    self.tick_node(node_id);
                }
            }
        }
    }

    #[test]
    fn test_precheck_order() {
        let mut cluster = Cluster::new(DirectoryConfig::default());

        let service = cluster.service(WEST);
        let empty = SceneTemplate::new(1, "", SceneSettings::default());
        assert_eq!(
            service.register_scene(&empty, true).state(),
            CallbackState::ErrorNoData
        );
        assert_eq!(
            service.lookup_scene("Arena").state(),
            CallbackState::ErrorServiceNotInitialized
        );

        cluster.service(WEST).start();
        cluster.links[&WEST].set(false);
        let service = cluster.service(WEST);
        assert_eq!(
            service.lookup_scene("").state(),
            CallbackState::ErrorNoData
        );
        assert_eq!(
            service.lookup_scene("Arena").state(),
            CallbackState::ErrorNoConnection
        );
        assert_eq!(service.pending_len(), 0);
    }

    #[test]
    fn test_start_requires_connection() {
        let mut cluster = Cluster::new(DirectoryConfig::default());
        cluster.links[&EAST].set(false);

        assert_eq!(
            cluster.service(EAST).start(),
            CallbackState::ErrorNoConnection
        );
        assert_eq!(cluster.service(EAST).lifecycle(), Lifecycle::Uninitialized);
    }

    #[test]
    fn test_register_then_lookup_round_trip_and_cache() {
        let mut cluster = Cluster::started();

        let register = cluster.service(WEST).register_scene(&arena(), false);
        assert_eq!(register.state(), CallbackState::ResponseSuccess);

        let first = cluster.service(EAST).lookup_scene("Arena");
        assert_eq!(first.state(), CallbackState::AwaitingResponse);
        cluster.pump();

        assert_eq!(first.state(), CallbackState::ResponseSuccess);
        let entry = first.response_data().unwrap();
        assert_eq!(entry.node_id, WEST);
        assert_eq!(entry.template.scene_name, "Arena");
        assert_eq!(entry.template.settings.server_address, Endpoint::new("10.0.0.2", 40_001));

        cluster.clock.advance(60.0);
        let second = cluster.service(EAST).lookup_scene("Arena");
        assert_eq!(second.state(), CallbackState::ResponseSuccess);
        assert_eq!(second.response_data().unwrap().node_id, WEST);
        assert_eq!(cluster.service(EAST).pending_len(), 0);
    }

    #[test]
    fn test_cached_lookup_expires() {
        let mut cluster = Cluster::started();
        cluster.service(WEST).register_scene(&arena(), false);
        cluster.service(EAST).lookup_scene("Arena");
        cluster.pump();
        assert!(cluster.service(EAST).cached_lookup("Arena").is_some());

        cluster.clock.advance(crate::SCENE_CACHE_LIFETIME_SECS + 1.0);
        cluster.tick_node(EAST);
        assert!(cluster.service(EAST).cached_lookup("Arena").is_none());

        let again = cluster.service(EAST).lookup_scene("Arena");
        assert_eq!(again.state(), CallbackState::AwaitingResponse);
    }

    #[test]
    fn test_lookup_miss_fails_and_is_not_cached() {
        let mut cluster = Cluster::started();

        let lookup = cluster.service(EAST).lookup_scene("Nowhere");
        cluster.pump();

        assert_eq!(lookup.state(), CallbackState::ResponseFailed);
        assert!(lookup.response_data().is_none());
        assert!(cluster.service(EAST).cached_lookup("Nowhere").is_none());
    }

    #[test]
    fn test_registration_is_exclusive_per_scene() {
        let mut cluster = Cluster::started();

        let first = cluster.service(WEST).register_scene(&arena(), true);
        cluster.pump();
        assert_eq!(first.state(), CallbackState::ResponseSuccess);

        let again = cluster.service(WEST).register_scene(&arena(), true);
        let rival = cluster.service(EAST).register_scene(&arena(), true);
        cluster.pump();

        assert_eq!(again.state(), CallbackState::ResponseSuccess);
        assert_eq!(rival.state(), CallbackState::ResponseFailed);
        let master = cluster.service(MASTER);
        assert_eq!(master.registered_owner("Arena"), Some(WEST));
        assert_eq!(master.registered_scenes(WEST).count(), 1);
        assert_eq!(master.registered_scenes(EAST).count(), 0);
    }

    #[test]
    fn test_only_owner_can_unregister() {
        let mut cluster = Cluster::started();
        cluster.service(WEST).register_scene(&arena(), false);
        cluster.pump();

        let foreign = cluster.service(EAST).unregister_scene("Arena", true);
        cluster.pump();
        assert_eq!(foreign.state(), CallbackState::ResponseFailed);

        let owner = cluster.service(WEST).unregister_scene("Arena", true);
        cluster.pump();
        assert_eq!(owner.state(), CallbackState::ResponseSuccess);
        assert_eq!(cluster.service(MASTER).registered_owner("Arena"), None);
    }

    #[test]
    fn test_scene_requests_must_come_from_the_named_node() {
        let mut cluster = Cluster::started();
        cluster.service(WEST).register_scene(&arena(), false);
        cluster.pump();

        let host = &mut RecordingHost::default();
        let spoofed = |kind: MessageKind, data: Vec<u8>| Incoming {
            from: PeerId::from(EAST),
            payload: Envelope::new(
                kind,
                0,
                &ServiceCallbackProto {
                    callback_id: 0,
                    source_node_id: WEST,
                    state: CallbackState::None as i32,
                    data,
                    require_confirmation: false,
                },
            )
            .to_bytes(),
        };

        let unregister = SceneNameProto {
            scene_name: "Arena".into(),
        };
        let master = cluster.service(MASTER);
        let result = master.handle(
            spoofed(MessageKind::UnregisterScene, unregister.encode_to_vec()),
            host,
        );
        assert_eq!(result, Ok(None));
        assert_eq!(master.registered_owner("Arena"), Some(WEST));

        let dungeon = NodeSceneTemplate {
            node_id: WEST,
            template: SceneTemplate::new(3, "Dungeon", SceneSettings::bound_to("10.0.0.2", 40_002)),
        };
        let register = NodeSceneTemplateProto::from(&dungeon).encode_to_vec();
        let result = master.handle(spoofed(MessageKind::RegisterScene, register), host);
        assert_eq!(result, Ok(None));
        assert_eq!(master.registered_owner("Dungeon"), None);
        assert_eq!(master.registered_scenes(WEST).count(), 1);
    }

    #[test]
    fn test_unanswered_request_times_out_once() {
        let mut cluster = Cluster::started();
        let lookup = cluster.service(EAST).lookup_scene("Arena");

        let responses = Rc::new(Cell::new(0));
        let timeouts = Rc::new(Cell::new(0));
        let seen = Rc::clone(&responses);
        lookup.on_response(move |_| seen.set(seen.get() + 1));
        let seen = Rc::clone(&timeouts);
        lookup.on_timeout(move |_| seen.set(seen.get() + 1));

        // The authority never gets to run; its reply is produced afterwards.
        cluster.clock.advance(30.0);
        cluster.tick_node(EAST);
        assert_eq!(lookup.state(), CallbackState::AwaitingResponse);

        cluster.clock.advance(0.5);
        cluster.tick_node(EAST);
        assert_eq!(lookup.state(), CallbackState::ErrorTimeout);
        assert_eq!(cluster.service(EAST).pending_len(), 0);

        cluster.pump();
        assert_eq!(timeouts.get(), 1);
        assert_eq!(responses.get(), 0);
        assert_eq!(lookup.state(), CallbackState::ErrorTimeout);
    }

    #[test]
    fn test_incremental_scan_times_out_over_several_ticks() {
        let config = DirectoryConfig {
            expiry_scan: ExpiryScan::Incremental,
            ..DirectoryConfig::default()
        };
        let mut cluster = Cluster::new(config);
        cluster.service(EAST).start();
        let first = cluster.service(EAST).lookup_scene("A");
        let second = cluster.service(EAST).lookup_scene("B");

        cluster.clock.advance(31.0);
        let service = cluster.service(EAST);
        let host = &mut RecordingHost::default();
        service.update(host);
        assert_eq!(service.pending_len(), 1);
        service.update(host);
        assert_eq!(service.pending_len(), 0);
        assert_eq!(first.state(), CallbackState::ErrorTimeout);
        assert_eq!(second.state(), CallbackState::ErrorTimeout);
    }

    #[test]
    fn test_relay_to_unknown_node_fails() {
        let mut cluster = Cluster::started();
        let request = InstantiateRequest {
            target_node_id: 42,
            scene_name: "Arena".to_string(),
            create_code: 1,
            behavior_data: Vec::new(),
            position: None,
            rotation: None,
            send_transform: false,
        };

        let callback = cluster.service(EAST).instantiate_in_node(&request);
        cluster.pump();
        assert_eq!(callback.state(), CallbackState::ResponseFailed);
    }

    #[test]
    fn test_instantiate_is_relayed_to_target_host() {
        let mut cluster = Cluster::started();
        let request = InstantiateRequest {
            target_node_id: WEST,
            scene_name: "Arena".to_string(),
            create_code: 7,
            behavior_data: vec![1, 2, 3],
            position: Some(scenegrid_sim::Vec3::new(1.0, 0.0, 2.0)),
            rotation: None,
            send_transform: true,
        };

        let callback = cluster.service(EAST).instantiate_in_node(&request);
        let mut rejected = request.clone();
        rejected.scene_name = "Lobby".to_string();
        let refused = cluster.service(EAST).instantiate_in_node(&rejected);
        cluster.pump();

        assert_eq!(callback.state(), CallbackState::ResponseSuccess);
        assert_eq!(refused.state(), CallbackState::ResponseFailed);
        assert_eq!(cluster.hosts[&WEST].spawned, vec![request]);
    }

    #[test]
    fn test_create_scene_auto_assigns_address() {
        let mut cluster = Cluster::started();
        cluster.hosts.get_mut(&WEST).unwrap().next_port = Some(42_005);

        let request = CreateSceneRequest {
            target_node_id: WEST,
            template: SceneTemplate::new(-1, "Dungeon-1", SceneSettings::default()),
            auto_assign_ip: true,
            auto_assign_port: true,
            scene_meta_data: Vec::new(),
        };
        let callback = cluster.service(EAST).create_scene_in_node(&request);
        cluster.pump();

        assert_eq!(callback.state(), CallbackState::ResponseSuccess);
        let created = callback.response_data().unwrap();
        assert_eq!(
            created.settings.server_address,
            Endpoint::new("192.168.1.10", 42_005)
        );
        assert_eq!(created.settings.client_address.port, 42_005);
        assert_eq!(cluster.hosts[&WEST].created, vec![created]);
    }

    #[test]
    fn test_create_scene_without_free_port_fails() {
        let mut cluster = Cluster::started();
        let request = CreateSceneRequest {
            target_node_id: WEST,
            template: SceneTemplate::new(-1, "Dungeon-1", SceneSettings::default()),
            auto_assign_ip: false,
            auto_assign_port: true,
            scene_meta_data: Vec::new(),
        };

        let callback = cluster.service(EAST).create_scene_in_node(&request);
        cluster.pump();
        assert_eq!(callback.state(), CallbackState::ResponseFailed);
        assert!(cluster.hosts[&WEST].created.is_empty());
    }

    #[test]
    fn test_authority_requests_resolve_through_loopback() {
        let mut cluster = Cluster::started();
        cluster.service(WEST).register_scene(&arena(), false);
        cluster.pump();

        let lookup = cluster.service(MASTER).lookup_scene("Arena");
        assert_eq!(lookup.state(), CallbackState::AwaitingResponse);

        cluster.tick_node(MASTER);
        assert_eq!(lookup.state(), CallbackState::ResponseSuccess);
        assert_eq!(lookup.response_data().unwrap().node_id, WEST);
    }

    #[test]
    fn test_disconnect_drops_node_registrations() {
        let mut cluster = Cluster::started();
        cluster.service(WEST).register_scene(&arena(), false);
        cluster.pump();

        let master = cluster.service(MASTER);
        assert_eq!(master.handle_peer_disconnected(PeerId::from(WEST)), Some(WEST));
        assert_eq!(master.registered_owner("Arena"), None);
        assert_eq!(master.node_peer(WEST), None);
        assert_eq!(master.handle_peer_disconnected(99), None);

        let rival = cluster.service(EAST).register_scene(&arena(), true);
        cluster.pump();
        assert_eq!(rival.state(), CallbackState::ResponseSuccess);
    }

    #[test]
    fn test_shutdown_times_out_pending_and_rejects_requests() {
        let mut cluster = Cluster::started();
        let lookup = cluster.service(EAST).lookup_scene("Arena");

        let service = cluster.service(EAST);
        service.shutdown();
        assert_eq!(lookup.state(), CallbackState::ErrorTimeout);
        assert_eq!(service.lifecycle(), Lifecycle::TornDown);
        assert_eq!(
            service.lookup_scene("Arena").state(),
            CallbackState::ErrorServiceNotInitialized
        );
        assert_eq!(service.start(), CallbackState::ErrorServiceNotInitialized);
    }

    #[test]
    fn test_callback_id_exhaustion_fails_request() {
        let config = DirectoryConfig {
            max_callback_id: 2,
            ..DirectoryConfig::default()
        };
        let mut cluster = Cluster::new(config);
        let service = cluster.service(EAST);
        service.start();

        assert_eq!(service.lookup_scene("A").id(), 1);
        assert_eq!(service.lookup_scene("B").id(), 2);
        let third = service.lookup_scene("C");
        assert_eq!(third.state(), CallbackState::ResponseFailed);
        assert_eq!(third.id(), 0);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let mut cluster = Cluster::started();
        let host = &mut RecordingHost::default();
        let garbage = Incoming {
            from: 3,
            payload: vec![0xff, 0xff, 0xff],
        };

        let result = cluster.service(MASTER).handle(garbage, host);
        assert!(matches!(result, Err(DirectoryError::Wire(_))));
    }

    #[test]
    fn test_node_rejects_authority_messages() {
        let mut cluster = Cluster::started();
        let host = &mut RecordingHost::default();
        let request = ServiceCallbackProto::default();
        let incoming = Incoming {
            from: 1,
            payload: Envelope::new(MessageKind::RegisterScene, 0, &request).to_bytes(),
        };

        let result = cluster.service(WEST).handle(incoming, host);
        assert_eq!(
            result,
            Err(DirectoryError::AuthorityOnly(MessageKind::RegisterScene))
        );
    }

    #[test]
    fn test_prediction_envelopes_pass_through() {
        let mut cluster = Cluster::started();
        let host = &mut RecordingHost::default();
        let incoming = Incoming {
            from: 1,
            payload: Envelope::new(MessageKind::SyncInputs, 9, &SceneNameProto::default())
                .to_bytes(),
        };

        let result = cluster.service(WEST).handle(incoming, host).unwrap();
        assert_eq!(result.map(|envelope| envelope.entity_id), Some(9));
        assert!(cluster.hub.borrow().inboxes.values().all(VecDeque::is_empty));
    }
}
