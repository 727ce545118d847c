//! Scenes hosted by one node process.
//!
//! Static scenes come from the node's templates at startup. Dynamic scenes
//! are created at runtime, bind a port from the node's dynamic range and are
//! registered with the directory so no other node claims the same name.
//!
//! A scene with a positive build index loads asynchronously: it waits in the
//! pending list until [`SceneRegistry::finish_loading`] and raises
//! [`SceneEvent::PendingSceneTimeout`] if that takes longer than the pending
//! lifetime. Every other scene is created immediately.
//!
//! A scene becomes ready once it is both created and registered.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use scenegrid_directory::{InstantiateRequest, Node, SceneHost, SceneTemplate};
use scenegrid_sim::{Quat, Vec3};
use scenegrid_util::{ExpiringList, IdPool, Observers, SharedClock, SubscriptionId};

use crate::NodeConfig;

// ============================================================================
// Scene Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Static,
    Dynamic,
}

/// An entity spawned into a scene through the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedEntity {
    pub create_code: i32,
    pub behavior_data: Vec<u8>,
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub send_transform: bool,
}

impl From<&InstantiateRequest> for SpawnedEntity {
    fn from(request: &InstantiateRequest) -> Self {
        Self {
            create_code: request.create_code,
            behavior_data: request.behavior_data.clone(),
            position: request.position,
            rotation: request.rotation,
            send_transform: request.send_transform,
        }
    }
}

/// A scene and its lifecycle flags.
#[derive(Debug, Clone)]
pub struct SceneEntry {
    pub template: SceneTemplate,
    pub kind: SceneKind,
    pub meta_data: Vec<u8>,
    pub is_created: bool,
    pub is_registered: bool,
    /// Set when the scene must go away as soon as it finishes loading.
    pub is_unregistered: bool,
    pub is_ready: bool,
    spawned: Vec<SpawnedEntity>,
}

impl SceneEntry {
    pub fn port(&self) -> u16 {
        self.template.settings.server_address.port
    }

    pub fn spawned(&self) -> &[SpawnedEntity] {
        &self.spawned
    }
}

/// Result of creating a scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneLoad {
    /// Created. `pending` while the scene is still loading.
    Accepted { pending: bool },
    /// Dropped: empty scene name.
    DroppedEmptyName,
    /// Dropped: a scene with this name already exists on this node.
    DroppedDuplicate,
    /// Dropped: dynamic port outside the node's range or already bound.
    DroppedPortUnavailable { port: u16 },
}

impl SceneLoad {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Scene lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneEvent {
    Created { scene_name: String },
    Ready { scene_name: String },
    Unloaded { scene_name: String },
    /// A loading scene exceeded the pending lifetime. `index` is its
    /// position in the pending list.
    PendingSceneTimeout { index: usize, scene_name: String },
}

/// Work the registry hands to the directory service.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryTask {
    Register(SceneTemplate),
    Unregister(String),
}

// ============================================================================
// Registry
// ============================================================================

pub struct SceneRegistry {
    register_dynamic_scenes: bool,
    register_requires_confirmation: bool,
    scenes_static: BTreeMap<String, SceneEntry>,
    scenes_dynamic: BTreeMap<String, SceneEntry>,
    /// `None` when the node has no dynamic port range.
    dynamic_ports: Option<IdPool<u16>>,
    pending: ExpiringList<String>,
    directory_tasks: Vec<DirectoryTask>,
    events: Observers<SceneEvent>,
}

impl SceneRegistry {
    pub fn new(config: &NodeConfig, node: &Node, clock: SharedClock) -> Self {
        let dynamic_ports = (node.dynamic_port_min != 0
            && node.dynamic_port_min <= node.dynamic_port_max)
            .then(|| IdPool::new(node.dynamic_port_min, node.dynamic_port_max, false));

        Self {
            register_dynamic_scenes: config.register_dynamic_scenes,
            register_requires_confirmation: config.register_requires_confirmation,
            scenes_static: BTreeMap::new(),
            scenes_dynamic: BTreeMap::new(),
            dynamic_ports,
            pending: ExpiringList::new(clock, config.pending_scene_lifetime),
            directory_tasks: Vec::new(),
            events: Observers::new(),
        }
    }

    /// Create every scene the node hosts from startup.
    pub fn load_static_scenes(&mut self, node: &Node) -> usize {
        let mut loaded = 0;
        for template in node.templates() {
            if self
                .create(SceneKind::Static, template.clone(), Vec::new())
                .is_accepted()
            {
                loaded += 1;
            }
        }
        loaded
    }

    /// Create a scene. Dynamic scenes claim their port and queue their
    /// directory registration.
    pub fn create(
        &mut self,
        kind: SceneKind,
        template: SceneTemplate,
        meta_data: Vec<u8>,
    ) -> SceneLoad {
        let scene_name = template.scene_name.clone();
        if scene_name.is_empty() {
            return SceneLoad::DroppedEmptyName;
        }
        if self.scene(&scene_name).is_some() {
            return SceneLoad::DroppedDuplicate;
        }

        let port = template.settings.server_address.port;
        if kind == SceneKind::Dynamic {
            let claimed = self
                .dynamic_ports
                .as_mut()
                .is_some_and(|ports| ports.add(port));
            if !claimed {
                return SceneLoad::DroppedPortUnavailable { port };
            }
        }

        let pending = template.build_index > 0;
        let registers = kind == SceneKind::Dynamic && self.register_dynamic_scenes;
        if registers {
            self.directory_tasks
                .push(DirectoryTask::Register(template.clone()));
        }

        let entry = SceneEntry {
            template,
            kind,
            meta_data,
            is_created: !pending,
            is_registered: !registers || !self.register_requires_confirmation,
            is_unregistered: false,
            is_ready: false,
            spawned: Vec::new(),
        };
        debug!(
            "scene {} created ({:?}, port={}, pending={})",
            scene_name, kind, port, pending
        );

        match kind {
            SceneKind::Static => self.scenes_static.insert(scene_name.clone(), entry),
            SceneKind::Dynamic => self.scenes_dynamic.insert(scene_name.clone(), entry),
        };

        if pending {
            self.pending.push(scene_name.clone());
        } else {
            self.events.emit(&SceneEvent::Created {
                scene_name: scene_name.clone(),
            });
        }
        self.try_ready(&scene_name);
        SceneLoad::Accepted { pending }
    }

    /// Complete an asynchronous load. Returns false if `scene_name` was not
    /// loading.
    pub fn finish_loading(&mut self, scene_name: &str) -> bool {
        let Some(index) = self.pending.find_index(|name| name == scene_name) else {
            return false;
        };
        self.pending.remove_at(index);

        let Some(entry) = self.scene_mut(scene_name) else {
            return false;
        };
        entry.is_created = true;
        let unregistered = entry.is_unregistered;
        self.events.emit(&SceneEvent::Created {
            scene_name: scene_name.to_string(),
        });

        if unregistered {
            self.unload(scene_name);
        } else {
            self.try_ready(scene_name);
        }
        true
    }

    /// Apply the directory's answer to a confirmed registration. A refused
    /// registration unloads the scene.
    pub fn confirm_registration(&mut self, scene_name: &str, success: bool) {
        let Some(entry) = self.scenes_dynamic.get_mut(scene_name) else {
            return;
        };

        if success {
            entry.is_registered = true;
            self.try_ready(scene_name);
        } else {
            warn!("registration of scene {} refused, unloading", scene_name);
            entry.is_registered = false;
            entry.is_unregistered = true;
            self.unload(scene_name);
        }
    }

    /// Unload a scene. A scene still loading is flagged and unloaded once
    /// the load completes.
    pub fn unload(&mut self, scene_name: &str) -> bool {
        let Some(entry) = self.scene_mut(scene_name) else {
            return false;
        };
        if !entry.is_created {
            entry.is_unregistered = true;
            return true;
        }

        let Some(entry) = self
            .scenes_static
            .remove(scene_name)
            .or_else(|| self.scenes_dynamic.remove(scene_name))
        else {
            return false;
        };

        if entry.kind == SceneKind::Dynamic {
            if let Some(ports) = self.dynamic_ports.as_mut() {
                ports.free(entry.port());
            }
            if self.register_dynamic_scenes && entry.is_registered {
                self.directory_tasks
                    .push(DirectoryTask::Unregister(scene_name.to_string()));
            }
        }
        info!("scene {} unloaded", scene_name);
        self.events.emit(&SceneEvent::Unloaded {
            scene_name: scene_name.to_string(),
        });
        true
    }

    /// Unload every scene of the selected kinds.
    pub fn unload_all(&mut self, unload_static: bool, unload_dynamic: bool) {
        let mut names = Vec::new();
        if unload_static {
            names.extend(self.scenes_static.keys().cloned());
        }
        if unload_dynamic {
            names.extend(self.scenes_dynamic.keys().cloned());
        }
        for scene_name in names {
            self.unload(&scene_name);
        }
    }

    /// Scan the pending list and raise timeouts.
    pub fn update(&mut self) {
        for index in self.pending.update() {
            let Some(scene_name) = self.pending.get(index).cloned() else {
                continue;
            };
            warn!("scene {} still loading after timeout", scene_name);
            self.events
                .emit(&SceneEvent::PendingSceneTimeout { index, scene_name });
        }
    }

    pub fn take_directory_tasks(&mut self) -> Vec<DirectoryTask> {
        std::mem::take(&mut self.directory_tasks)
    }

    fn try_ready(&mut self, scene_name: &str) {
        let Some(entry) = self.scene_mut(scene_name) else {
            return;
        };
        if !entry.is_created || !entry.is_registered || entry.is_unregistered || entry.is_ready {
            return;
        }

        entry.is_ready = true;
        debug!("scene {} ready", scene_name);
        self.events.emit(&SceneEvent::Ready {
            scene_name: scene_name.to_string(),
        });
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn scene(&self, scene_name: &str) -> Option<&SceneEntry> {
        self.scenes_static
            .get(scene_name)
            .or_else(|| self.scenes_dynamic.get(scene_name))
    }

    fn scene_mut(&mut self, scene_name: &str) -> Option<&mut SceneEntry> {
        match self.scenes_static.get_mut(scene_name) {
            Some(entry) => Some(entry),
            None => self.scenes_dynamic.get_mut(scene_name),
        }
    }

    pub fn is_static(&self, scene_name: &str) -> bool {
        self.scenes_static.contains_key(scene_name)
    }

    pub fn scenes(&self) -> impl Iterator<Item = &SceneEntry> {
        self.scenes_static.values().chain(self.scenes_dynamic.values())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_port_bound(&self, port: u16) -> bool {
        self.dynamic_ports
            .as_ref()
            .is_some_and(|ports| ports.contains(port))
    }

    pub fn on_event(&mut self, handler: impl FnMut(&SceneEvent) + 'static) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl SceneHost for SceneRegistry {
    fn instantiate_in_scene(&mut self, request: &InstantiateRequest) -> bool {
        let Some(entry) = self.scene_mut(&request.scene_name) else {
            return false;
        };
        if !entry.is_ready {
            return false;
        }

        entry.spawned.push(SpawnedEntity::from(request));
        debug!(
            "spawned code={} in scene {} ({} entities)",
            request.create_code,
            request.scene_name,
            entry.spawned.len()
        );
        true
    }

    fn create_scene(&mut self, template: SceneTemplate, meta_data: &[u8]) -> bool {
        self.create(SceneKind::Dynamic, template, meta_data.to_vec())
            .is_accepted()
    }

    fn peek_dynamic_port(&self) -> Option<u16> {
        self.dynamic_ports.as_ref()?.peek_next()
    }
}

// ============================================================================
// Tests
// ============================================================================
