//! The node process: directory endpoint, hosted scenes and predicted
//! entities of one cluster node.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use scenegrid_directory::{
    CallbackState, Lifecycle, Node, NodeId, NodeService, SceneTemplate, ServiceCallback,
};
use scenegrid_prediction::{InputListener, NetworkedEntity, PredictedBody, PredictedEntity, Role};
use scenegrid_util::SharedClock;
use scenegrid_wire::{EntityId, Envelope, PeerId, Transport};

use crate::NodeConfig;
use crate::registry::{DirectoryTask, SceneKind, SceneLoad, SceneRegistry};

pub struct NodeProcess<T: Transport, E = PredictedBody> {
    config: NodeConfig,
    node: Node,
    service: NodeService<T>,
    scenes: SceneRegistry,
    /// Scene registrations awaiting the directory's confirmation.
    registrations: Vec<(String, ServiceCallback<()>)>,
    entities: BTreeMap<EntityId, NetworkedEntity<E>>,
}

impl<T: Transport, E: PredictedEntity> NodeProcess<T, E> {
    pub fn new(config: NodeConfig, node: Node, clock: SharedClock, transport: T) -> Self {
        let service = NodeService::new(config.directory.clone(), &node, clock.clone(), transport);
        let scenes = SceneRegistry::new(&config, &node, clock);

        Self {
            config,
            node,
            service,
            scenes,
            registrations: Vec::new(),
            entities: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the directory endpoint and load the node's static scenes.
    pub fn start(&mut self) -> CallbackState {
        let first_start = self.service.lifecycle() == Lifecycle::Uninitialized;
        let state = self.service.start();
        if state.is_success() && first_start {
            let loaded = self.scenes.load_static_scenes(&self.node);
            info!(
                "node {} ({}) started with {} static scenes",
                self.node.node_id, self.node.node_name, loaded
            );
            self.flush_directory_tasks();
        }
        state
    }

    /// Unload dynamic scenes, then tear the directory endpoint down.
    pub fn shutdown(&mut self) {
        self.scenes.unload_all(false, true);
        self.flush_directory_tasks();
        self.registrations.clear();
        self.service.shutdown();
    }

    /// One fixed step. See the crate docs for the order of work.
    pub fn tick(&mut self) {
        for (from, envelope) in self.service.poll(&mut self.scenes) {
            self.route(from, &envelope);
        }
        for entity in self.entities.values_mut() {
            entity.fixed_update(self.service.transport_mut());
        }

        self.service.update(&mut self.scenes);
        self.scenes.update();
        self.settle_registrations();
        self.flush_directory_tasks();
    }

    /// Authority only: forget a peer whose connection dropped, with the
    /// entities it owned and the scenes it registered.
    pub fn peer_disconnected(&mut self, peer: PeerId) -> Option<NodeId> {
        let before = self.entities.len();
        self.entities
            .retain(|_, entity| entity.role() != Role::Authority { owner: peer });
        let removed = before - self.entities.len();
        if removed > 0 {
            info!("dropped {} entities owned by peer {}", removed, peer);
        }
        self.service.handle_peer_disconnected(peer)
    }

    fn route(&mut self, from: PeerId, envelope: &Envelope) {
        let Some(entity) = self.entities.get_mut(&envelope.entity_id) else {
            debug!(
                "node {}: no entity {} for message from peer {}",
                self.node.node_id, envelope.entity_id, from
            );
            return;
        };
        if let Err(err) = entity.receive(from, envelope) {
            warn!(
                "node {}: dropped message from peer {}: {}",
                self.node.node_id, from, err
            );
        }
    }

    // ========================================================================
    // Scenes
    // ========================================================================

    /// Create a dynamic scene on this node and register it with the
    /// directory.
    pub fn create_dynamic_scene(&mut self, template: SceneTemplate, meta_data: Vec<u8>) -> SceneLoad {
        if self.service.cached_lookup(&template.scene_name).is_some() {
            return SceneLoad::DroppedDuplicate;
        }

        let load = self.scenes.create(SceneKind::Dynamic, template, meta_data);
        self.flush_directory_tasks();
        load
    }

    pub fn unload_scene(&mut self, scene_name: &str) -> bool {
        let unloaded = self.scenes.unload(scene_name);
        self.flush_directory_tasks();
        unloaded
    }

    /// Report that an asynchronously loading scene finished loading.
    pub fn finish_loading(&mut self, scene_name: &str) -> bool {
        let finished = self.scenes.finish_loading(scene_name);
        self.flush_directory_tasks();
        finished
    }

    /// Template of `scene_name` from the node's own map entry, the hosted
    /// scenes or the lookup cache.
    pub fn find_scene_template(&self, scene_name: &str) -> Option<SceneTemplate> {
        self.node
            .template(scene_name)
            .or_else(|| self.scenes.scene(scene_name).map(|entry| &entry.template))
            .or_else(|| {
                self.service
                    .cached_lookup(scene_name)
                    .map(|entry| &entry.template)
            })
            .cloned()
    }

    fn settle_registrations(&mut self) {
        let mut settled = Vec::new();
        self.registrations.retain(|(scene_name, callback)| {
            if !callback.is_resolved() {
                return true;
            }
            settled.push((scene_name.clone(), callback.state()));
            false
        });

        for (scene_name, state) in settled {
            debug!("registration of scene {} settled: {:?}", scene_name, state);
            self.scenes
                .confirm_registration(&scene_name, state.is_success());
        }
    }

    fn flush_directory_tasks(&mut self) {
        for task in self.scenes.take_directory_tasks() {
            match task {
                DirectoryTask::Register(template) => self.register(template),
                DirectoryTask::Unregister(scene_name) => {
                    let state = self.service.unregister_scene(&scene_name, false).state();
                    if !state.is_success() {
                        warn!("unregistering scene {} failed: {:?}", scene_name, state);
                    }
                }
            }
        }
    }

    fn register(&mut self, template: SceneTemplate) {
        let callback = self
            .service
            .register_scene(&template, self.config.register_requires_confirmation);
        match callback.state() {
            CallbackState::AwaitingResponse => {
                self.registrations.push((template.scene_name, callback));
            }
            state if state.is_success() => {}
            state => {
                warn!(
                    "registering scene {} failed: {:?}",
                    template.scene_name, state
                );
                self.scenes.confirm_registration(&template.scene_name, false);
            }
        }
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Simulate `entity_id` on this node. Returns false if it already exists.
    pub fn spawn_entity(&mut self, entity_id: EntityId, role: Role, entity: E) -> bool {
        if self.entities.contains_key(&entity_id) {
            return false;
        }

        let listener = InputListener::new(self.config.prediction);
        self.entities
            .insert(entity_id, NetworkedEntity::new(entity_id, role, listener, entity));
        debug!(
            "node {}: spawned entity {} as {:?}",
            self.node.node_id, entity_id, role
        );
        true
    }

    pub fn despawn_entity(&mut self, entity_id: EntityId) -> Option<NetworkedEntity<E>> {
        self.entities.remove(&entity_id)
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&NetworkedEntity<E>> {
        self.entities.get(&entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: EntityId) -> Option<&mut NetworkedEntity<E>> {
        self.entities.get_mut(&entity_id)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn service(&self) -> &NodeService<T> {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut NodeService<T> {
        &mut self.service
    }

    pub fn scenes(&self) -> &SceneRegistry {
        &self.scenes
    }

    pub fn scenes_mut(&mut self) -> &mut SceneRegistry {
        &mut self.scenes
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use scenegrid_directory::{
        CreateSceneRequest, Endpoint, InstantiateRequest, NodeMap, SceneSettings,
    };
    use scenegrid_sim::{MovementModel, Vec3};
    use scenegrid_util::ManualClock;

    use crate::network::{LinkConditions, MemoryEndpoint, MemoryNetwork, UnreliableDelivery};

    const MASTER: NodeId = 1;
    const WEST: NodeId = 2;
    const EAST: NodeId = 3;
    const PLAYER: EntityId = 9;

    fn peer(node_id: NodeId) -> PeerId {
        PeerId::from(node_id)
    }

    fn arena() -> SceneTemplate {
        SceneTemplate::new(-1, "Arena", SceneSettings::bound_to("10.0.0.2", 40_000))
    }

    fn body() -> PredictedBody {
        PredictedBody::new(Vec3::ZERO, MovementModel::default())
    }

    /// Three nodes over one in-memory network. Peer handles equal node ids.
    struct Cluster {
        config: NodeConfig,
        clock: ManualClock,
        network: MemoryNetwork,
        processes: BTreeMap<NodeId, NodeProcess<MemoryEndpoint>>,
    }

    impl Cluster {
        fn new(config: NodeConfig) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let master = SceneSettings::bound_to("192.168.1.10", 7000);
            let map = NodeMap::new([
                Node::new(MASTER, "master", true).with_authority_settings(master.clone()),
                Node::new(WEST, "west", false)
                    .with_authority_settings(master.clone())
                    .with_dynamic_ports(40_000, 40_002),
                Node::new(EAST, "east", false)
                    .with_authority_settings(master)
                    .with_dynamic_ports(41_000, 41_002)
                    .with_template(SceneTemplate::new(
                        0,
                        "Lobby",
                        SceneSettings::bound_to("10.0.0.3", 7100),
                    )),
            ])
            .unwrap();

            let clock = ManualClock::new(0.0);
            let network = MemoryNetwork::new(peer(MASTER), LinkConditions::default());
            let processes = map
                .nodes()
                .map(|node| {
                    let endpoint = network.endpoint(peer(node.node_id));
                    let process =
                        NodeProcess::new(config.clone(), node.clone(), clock.shared(), endpoint);
                    (node.node_id, process)
                })
                .collect();

            Self {
                config,
                clock,
                network,
                processes,
            }
        }

        fn started(config: NodeConfig) -> Self {
            let mut cluster = Self::new(config);
            for process in cluster.processes.values_mut() {
                assert_eq!(process.start(), CallbackState::ResponseSuccess);
            }
            cluster.pump();
            cluster
        }

        fn process(&mut self, node_id: NodeId) -> &mut NodeProcess<MemoryEndpoint> {
            self.processes.get_mut(&node_id).unwrap()
        }

        fn step(&mut self) {
            let dt = self.config.tick_interval();
            self.clock.advance(dt);
            self.network.advance(dt);

            let disconnected = self.network.take_disconnected();
            let master = self.process(MASTER);
            for peer in disconnected {
                master.peer_disconnected(peer);
            }

            for process in self.processes.values_mut() {
                process.tick();
            }
        }

        fn pump(&mut self) {
            for _ in 0..8 {
                self.step();
            }
        }

        /// Tick every process without delivering anything.
        fn step_offline(&mut self) {
            self.clock.advance(self.config.tick_interval());
            for process in self.processes.values_mut() {
                process.tick();
            }
        }
    }

    #[test]
    fn test_arena_lookup_round_trip_then_cache() {
        let mut cluster = Cluster::started(NodeConfig::default());

        let load = cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        assert_eq!(load, SceneLoad::Accepted { pending: false });
        assert!(cluster.process(WEST).scenes().scene("Arena").unwrap().is_ready);
        cluster.pump();
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Arena"),
            Some(WEST)
        );

        let first = cluster.process(EAST).service_mut().lookup_scene("Arena");
        assert_eq!(first.state(), CallbackState::AwaitingResponse);
        cluster.pump();

        assert_eq!(first.state(), CallbackState::ResponseSuccess);
        let entry = first.response_data().unwrap();
        assert_eq!(entry.node_id, WEST);
        assert_eq!(entry.template.scene_name, "Arena");
        assert_eq!(
            entry.template.settings.server_address,
            Endpoint::new("10.0.0.2", 40_000)
        );

        let second = cluster.process(EAST).service_mut().lookup_scene("Arena");
        assert_eq!(second.state(), CallbackState::ResponseSuccess);
        assert_eq!(second.response_data().unwrap().node_id, WEST);
        assert_eq!(cluster.process(EAST).service().pending_len(), 0);
        assert!(cluster.process(EAST).find_scene_template("Arena").is_some());
    }

    #[test]
    fn test_static_scenes_load_on_start() {
        let mut cluster = Cluster::started(NodeConfig::default());

        let east = cluster.process(EAST);
        let lobby = east.scenes().scene("Lobby").unwrap();
        assert!(lobby.is_ready);
        assert_eq!(lobby.kind, SceneKind::Static);
        assert!(east.find_scene_template("Lobby").is_some());

        assert!(cluster.process(WEST).find_scene_template("Lobby").is_none());
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Lobby"),
            None
        );
    }

    #[test]
    fn test_confirmed_registration_readies_after_round_trip() {
        let config = NodeConfig {
            register_requires_confirmation: true,
            ..Default::default()
        };
        let mut cluster = Cluster::started(config);

        cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        assert!(!cluster.process(WEST).scenes().scene("Arena").unwrap().is_ready);

        cluster.pump();
        assert!(cluster.process(WEST).scenes().scene("Arena").unwrap().is_ready);
    }

    #[test]
    fn test_refused_registration_unloads_scene() {
        let config = NodeConfig {
            register_requires_confirmation: true,
            ..Default::default()
        };
        let mut cluster = Cluster::started(config);
        let taken = SceneTemplate::new(-1, "Arena", SceneSettings::bound_to("10.0.0.3", 41_000));
        cluster.process(EAST).create_dynamic_scene(taken, Vec::new());
        cluster.pump();

        cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        cluster.pump();

        let west = cluster.process(WEST);
        assert!(west.scenes().scene("Arena").is_none());
        assert!(!west.scenes().is_port_bound(40_000));
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Arena"),
            Some(EAST)
        );
    }

    #[test]
    fn test_create_scene_in_node_through_directory() {
        let mut cluster = Cluster::started(NodeConfig::default());
        let request = CreateSceneRequest {
            target_node_id: WEST,
            template: SceneTemplate::new(-1, "Dungeon-1", SceneSettings::default()),
            auto_assign_ip: true,
            auto_assign_port: true,
            scene_meta_data: vec![5],
        };

        let callback = cluster.process(EAST).service_mut().create_scene_in_node(&request);
        cluster.pump();

        assert_eq!(callback.state(), CallbackState::ResponseSuccess);
        let created = callback.response_data().unwrap();
        assert_eq!(
            created.settings.server_address,
            Endpoint::new("192.168.1.10", 40_000)
        );

        let west = cluster.process(WEST);
        let scene = west.scenes().scene("Dungeon-1").unwrap();
        assert!(scene.is_ready);
        assert_eq!(scene.meta_data, vec![5]);
        assert!(west.scenes().is_port_bound(40_000));
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Dungeon-1"),
            Some(WEST)
        );
    }

    #[test]
    fn test_instantiate_in_node_spawns_into_ready_scene() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        cluster.pump();

        let mut request = InstantiateRequest {
            target_node_id: WEST,
            scene_name: "Arena".into(),
            create_code: 3,
            behavior_data: vec![1],
            position: Some(Vec3::new(0.0, 1.0, 0.0)),
            rotation: None,
            send_transform: true,
        };
        let spawned = cluster.process(EAST).service_mut().instantiate_in_node(&request);
        request.scene_name = "Nowhere".into();
        let missing = cluster.process(EAST).service_mut().instantiate_in_node(&request);
        cluster.pump();

        assert_eq!(spawned.state(), CallbackState::ResponseSuccess);
        assert_eq!(missing.state(), CallbackState::ResponseFailed);
        let arena = cluster.process(WEST).scenes().scene("Arena").unwrap();
        assert_eq!(arena.spawned().len(), 1);
        assert_eq!(arena.spawned()[0].create_code, 3);
    }

    #[test]
    fn test_unload_unregisters_scene() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        cluster.pump();

        assert!(cluster.process(WEST).unload_scene("Arena"));
        cluster.pump();

        assert!(!cluster.process(WEST).scenes().is_port_bound(40_000));
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Arena"),
            None
        );
    }

    #[test]
    fn test_shutdown_unregisters_dynamic_scenes() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        cluster.pump();

        cluster.process(WEST).shutdown();
        cluster.pump();

        assert_eq!(
            cluster.process(WEST).service().lifecycle(),
            Lifecycle::TornDown
        );
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Arena"),
            None
        );
    }

    #[test]
    fn test_node_disconnect_drops_its_scenes() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.process(WEST).create_dynamic_scene(arena(), Vec::new());
        cluster.pump();

        assert!(cluster.network.disconnect(peer(WEST)));
        cluster.step();
        assert_eq!(
            cluster.process(MASTER).service().registered_owner("Arena"),
            None
        );

        let lookup = cluster.process(EAST).service_mut().lookup_scene("Arena");
        cluster.pump();
        assert_eq!(lookup.state(), CallbackState::ResponseFailed);
    }

    #[test]
    fn test_prediction_converges_after_jitter() {
        let mut cluster = Cluster::started(NodeConfig::default());
        assert!(cluster.process(MASTER).spawn_entity(
            PLAYER,
            Role::Authority { owner: peer(EAST) },
            body()
        ));
        assert!(cluster.process(EAST).spawn_entity(PLAYER, Role::Owner, body()));
        assert!(!cluster.process(EAST).spawn_entity(PLAYER, Role::Owner, body()));

        for tick in 0..20 {
            let owner = cluster.process(EAST).entity_mut(PLAYER).unwrap();
            if tick == 10 {
                owner.entity_mut().displace(Vec3::new(2.0, 0.0, 0.0));
            }
            owner.record_movement(0.0, 1.0);
            cluster.step();
        }
        cluster
            .process(EAST)
            .entity_mut(PLAYER)
            .unwrap()
            .record_movement(0.0, 0.0);
        cluster.pump();

        let authority = cluster.process(MASTER).entity(PLAYER).unwrap().entity().position();
        let owner = cluster.process(EAST).entity(PLAYER).unwrap();
        assert!(authority.z > 0.0);
        assert!(owner.entity().position().distance(authority) < 1e-9);
        assert!(owner.listener().authoritative_frame() > 10);
    }

    #[test]
    fn test_dropped_history_never_reconciles() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.network.set_conditions(LinkConditions {
            latency: 0.0,
            unreliable: UnreliableDelivery::Drop,
        });
        cluster.process(MASTER).spawn_entity(
            PLAYER,
            Role::Authority { owner: peer(EAST) },
            body(),
        );
        cluster.process(EAST).spawn_entity(PLAYER, Role::Owner, body());

        for _ in 0..5 {
            cluster
                .process(EAST)
                .entity_mut(PLAYER)
                .unwrap()
                .record_movement(1.0, 0.0);
            cluster.step();
        }
        cluster.pump();

        let authority = cluster.process(MASTER).entity(PLAYER).unwrap().entity().position();
        assert!(authority.x > 0.0);
        let owner = cluster.process(EAST).entity(PLAYER).unwrap();
        assert_eq!(owner.listener().authoritative_frame(), 0);
        assert!(!owner.listener().local_history().is_empty());
        assert!(cluster.network.dropped() > 0);
    }

    #[test]
    fn test_reordered_history_keeps_newest_frame() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.network.set_conditions(LinkConditions {
            latency: 0.0,
            unreliable: UnreliableDelivery::Reverse,
        });
        cluster.process(MASTER).spawn_entity(
            PLAYER,
            Role::Authority { owner: peer(EAST) },
            body(),
        );
        cluster.process(EAST).spawn_entity(PLAYER, Role::Owner, body());
        cluster
            .process(EAST)
            .entity_mut(PLAYER)
            .unwrap()
            .record_movement(1.0, 0.0);

        // Frames 1..=4 reach the authority together, which then plays one per
        // tick and queues four single-frame history batches for the owner.
        for _ in 0..4 {
            cluster.step_offline();
        }
        cluster.network.advance(cluster.config.tick_interval());
        for _ in 0..4 {
            cluster.step_offline();
        }

        // The owner receives frames 4, 3, 2, 1 in that order.
        cluster.network.advance(cluster.config.tick_interval());
        cluster.step_offline();
        let owner = cluster.process(EAST).entity(PLAYER).unwrap();
        assert_eq!(owner.listener().authoritative_frame(), 4);
        assert_eq!(owner.listener().authority_history(), 0);

        cluster
            .process(EAST)
            .entity_mut(PLAYER)
            .unwrap()
            .record_movement(0.0, 0.0);
        cluster.pump();
        cluster.pump();

        let authority = cluster.process(MASTER).entity(PLAYER).unwrap().entity().position();
        let owner = cluster.process(EAST).entity(PLAYER).unwrap();
        assert!(authority.x > 0.0);
        assert!(owner.entity().position().distance(authority) < 1e-9);
        assert!(owner.listener().authoritative_frame() > 4);
    }

    #[test]
    fn test_owner_disconnect_drops_authority_entities() {
        let mut cluster = Cluster::started(NodeConfig::default());
        cluster.process(MASTER).spawn_entity(
            PLAYER,
            Role::Authority { owner: peer(EAST) },
            body(),
        );

        cluster.network.disconnect(peer(EAST));
        cluster.step();
        assert!(cluster.process(MASTER).entity(PLAYER).is_none());
    }
}
