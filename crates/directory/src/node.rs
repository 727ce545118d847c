//! Cluster topology: nodes, scene templates and the node map.
//!
//! The node map is static configuration supplied by the host at startup.
//! Only a node's live scene-template set changes at runtime.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

use scenegrid_sim::Vec3;
use scenegrid_wire::{
    EndpointProto, NodeId, NodeSceneTemplateProto, SceneSettingsProto, SceneTemplateProto,
    WireError,
};
use thiserror::Error;

/// Default connection cap for a scene.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 64;

// ============================================================================
// Scene Templates
// ============================================================================

/// Bind address of a scene's network endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

/// Transport protocol a scene listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

/// Network settings bundle of a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSettings {
    pub max_connections: u32,
    pub transport: TransportKind,
    pub server_address: Endpoint,
    pub server_nat_address: Endpoint,
    pub client_address: Endpoint,
    pub client_nat_address: Endpoint,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            transport: TransportKind::Udp,
            server_address: Endpoint::default(),
            server_nat_address: Endpoint::default(),
            client_address: Endpoint::default(),
            client_nat_address: Endpoint::default(),
        }
    }
}

impl SceneSettings {
    /// Settings serving and connecting on the same address.
    pub fn bound_to(ip: impl Into<String>, port: u16) -> Self {
        let endpoint = Endpoint::new(ip, port);
        Self {
            server_address: endpoint.clone(),
            client_address: endpoint,
            ..Self::default()
        }
    }
}

/// A loadable unit of simulation. `scene_name` is unique process-wide.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneTemplate {
    /// Build/resource index. Non-positive indices create an empty scene.
    pub build_index: i32,
    pub scene_name: String,
    pub scene_offset: Vec3,
    pub settings: SceneSettings,
}

impl SceneTemplate {
    pub fn new(build_index: i32, scene_name: impl Into<String>, settings: SceneSettings) -> Self {
        Self {
            build_index,
            scene_name: scene_name.into(),
            scene_offset: Vec3::ZERO,
            settings,
        }
    }

    pub fn with_offset(mut self, offset: Vec3) -> Self {
        self.scene_offset = offset;
        self
    }
}

/// A scene template together with the node hosting it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSceneTemplate {
    pub node_id: NodeId,
    pub template: SceneTemplate,
}

// ============================================================================
// Nodes
// ============================================================================

/// A participant in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub node_id: NodeId,
    pub node_name: String,
    /// At most one node per map is the authority.
    pub is_authority: bool,
    pub dynamic_port_min: u16,
    pub dynamic_port_max: u16,
    /// Endpoint settings of the directory connection this node serves (as
    /// the authority) or connects to.
    pub authority_settings: SceneSettings,
    /// Scenes this node hosts from startup, keyed by name.
    templates: BTreeMap<String, SceneTemplate>,
}

impl Node {
    pub fn new(node_id: NodeId, node_name: impl Into<String>, is_authority: bool) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            is_authority,
            dynamic_port_min: 0,
            dynamic_port_max: 0,
            authority_settings: SceneSettings::default(),
            templates: BTreeMap::new(),
        }
    }

    pub fn with_dynamic_ports(mut self, min: u16, max: u16) -> Self {
        self.dynamic_port_min = min;
        self.dynamic_port_max = max;
        self
    }

    pub fn with_authority_settings(mut self, settings: SceneSettings) -> Self {
        self.authority_settings = settings;
        self
    }

    pub fn with_template(mut self, template: SceneTemplate) -> Self {
        self.add_template(template);
        self
    }

    pub fn dynamic_ports(&self) -> RangeInclusive<u16> {
        self.dynamic_port_min..=self.dynamic_port_max
    }

    /// Add a template. Returns false if the name is already hosted here.
    pub fn add_template(&mut self, template: SceneTemplate) -> bool {
        if self.templates.contains_key(&template.scene_name) {
            return false;
        }
        self.templates.insert(template.scene_name.clone(), template);
        true
    }

    pub fn remove_template(&mut self, scene_name: &str) -> Option<SceneTemplate> {
        self.templates.remove(scene_name)
    }

    pub fn template(&self, scene_name: &str) -> Option<&SceneTemplate> {
        self.templates.get(scene_name)
    }

    pub fn hosts(&self, scene_name: &str) -> bool {
        self.templates.contains_key(scene_name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &SceneTemplate> {
        self.templates.values()
    }
}

/// Invalid node map configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeMapError {
    #[error("node id 0 is reserved")]
    ReservedNodeId,

    #[error("duplicate node id {0}")]
    DuplicateNodeId(NodeId),

    #[error("duplicate node name `{0}`")]
    DuplicateNodeName(String),

    #[error("nodes {first} and {second} are both marked as authority")]
    MultipleAuthorities { first: NodeId, second: NodeId },

    #[error("node {node_id} has inverted dynamic port range {min}..={max}")]
    InvalidPortRange { node_id: NodeId, min: u16, max: u16 },
}

/// Every node of the cluster, indexed by id and name.
#[derive(Debug, Clone, Default)]
pub struct NodeMap {
    nodes: BTreeMap<NodeId, Node>,
    names: HashMap<String, NodeId>,
    authority: Option<NodeId>,
}

impl NodeMap {
    /// Build and validate a node map.
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Result<Self, NodeMapError> {
        let mut map = Self::default();
        for node in nodes {
            map.insert(node)?;
        }
        Ok(map)
    }

    fn insert(&mut self, node: Node) -> Result<(), NodeMapError> {
        if node.node_id == 0 {
            return Err(NodeMapError::ReservedNodeId);
        }
        if self.nodes.contains_key(&node.node_id) {
            return Err(NodeMapError::DuplicateNodeId(node.node_id));
        }
        if self.names.contains_key(&node.node_name) {
            return Err(NodeMapError::DuplicateNodeName(node.node_name));
        }
        if node.dynamic_port_min > node.dynamic_port_max {
            return Err(NodeMapError::InvalidPortRange {
                node_id: node.node_id,
                min: node.dynamic_port_min,
                max: node.dynamic_port_max,
            });
        }
        if node.is_authority {
            if let Some(first) = self.authority {
                return Err(NodeMapError::MultipleAuthorities {
                    first,
                    second: node.node_id,
                });
            }
            self.authority = Some(node.node_id);
        }

        self.names.insert(node.node_name.clone(), node.node_id);
        self.nodes.insert(node.node_id, node);
        Ok(())
    }

    pub fn by_id(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn by_name(&self, node_name: &str) -> Option<&Node> {
        self.names.get(node_name).and_then(|id| self.nodes.get(id))
    }

    pub fn authority(&self) -> Option<&Node> {
        self.authority.and_then(|id| self.nodes.get(&id))
    }

    /// First node (by id) hosting `scene_name` from startup.
    pub fn node_for_scene(&self, scene_name: &str) -> Option<&Node> {
        self.nodes.values().find(|node| node.hosts(scene_name))
    }

    pub fn template_for_scene(&self, scene_name: &str) -> Option<&SceneTemplate> {
        self.node_for_scene(scene_name)
            .and_then(|node| node.template(scene_name))
    }

    pub fn node_template_for_scene(&self, scene_name: &str) -> Option<NodeSceneTemplate> {
        let node = self.node_for_scene(scene_name)?;
        let template = node.template(scene_name)?.clone();
        Some(NodeSceneTemplate {
            node_id: node.node_id,
            template,
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

fn port_from_wire(field: &'static str, port: u32) -> Result<u16, WireError> {
    u16::try_from(port).map_err(|_| WireError::OutOfRange {
        field,
        value: u64::from(port),
    })
}

impl From<&Endpoint> for EndpointProto {
    fn from(e: &Endpoint) -> Self {
        Self {
            ip: e.ip.clone(),
            port: u32::from(e.port),
        }
    }
}

impl TryFrom<EndpointProto> for Endpoint {
    type Error = WireError;

    fn try_from(e: EndpointProto) -> Result<Self, Self::Error> {
        Ok(Self {
            port: port_from_wire("port", e.port)?,
            ip: e.ip,
        })
    }
}

fn endpoint_from_wire(e: Option<EndpointProto>) -> Result<Endpoint, WireError> {
    e.map(Endpoint::try_from).transpose().map(Option::unwrap_or_default)
}

impl From<&SceneSettings> for SceneSettingsProto {
    fn from(s: &SceneSettings) -> Self {
        Self {
            max_connections: s.max_connections,
            use_tcp: s.transport == TransportKind::Tcp,
            server_address: Some((&s.server_address).into()),
            server_nat_address: Some((&s.server_nat_address).into()),
            client_address: Some((&s.client_address).into()),
            client_nat_address: Some((&s.client_nat_address).into()),
        }
    }
}

impl TryFrom<SceneSettingsProto> for SceneSettings {
    type Error = WireError;

    fn try_from(s: SceneSettingsProto) -> Result<Self, Self::Error> {
        Ok(Self {
            max_connections: s.max_connections,
            transport: if s.use_tcp {
                TransportKind::Tcp
            } else {
                TransportKind::Udp
            },
            server_address: endpoint_from_wire(s.server_address)?,
            server_nat_address: endpoint_from_wire(s.server_nat_address)?,
            client_address: endpoint_from_wire(s.client_address)?,
            client_nat_address: endpoint_from_wire(s.client_nat_address)?,
        })
    }
}

impl From<&SceneTemplate> for SceneTemplateProto {
    fn from(t: &SceneTemplate) -> Self {
        Self {
            build_index: t.build_index,
            scene_name: t.scene_name.clone(),
            scene_offset: Some(t.scene_offset.into()),
            settings: Some((&t.settings).into()),
        }
    }
}

impl TryFrom<SceneTemplateProto> for SceneTemplate {
    type Error = WireError;

    fn try_from(t: SceneTemplateProto) -> Result<Self, Self::Error> {
        let settings = t.settings.ok_or(WireError::MissingField("settings"))?;
        Ok(Self {
            build_index: t.build_index,
            scene_name: t.scene_name,
            scene_offset: t.scene_offset.map(Vec3::from).unwrap_or_default(),
            settings: settings.try_into()?,
        })
    }
}

impl From<&NodeSceneTemplate> for NodeSceneTemplateProto {
    fn from(t: &NodeSceneTemplate) -> Self {
        Self {
            node_id: t.node_id,
            template: Some((&t.template).into()),
        }
    }
}

impl TryFrom<NodeSceneTemplateProto> for NodeSceneTemplate {
    type Error = WireError;

    fn try_from(t: NodeSceneTemplateProto) -> Result<Self, Self::Error> {
        let template = t.template.ok_or(WireError::MissingField("template"))?;
        Ok(Self {
            node_id: t.node_id,
            template: template.try_into()?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
