//! The node-side collaborator that owns scenes and entities.

use scenegrid_sim::{Quat, Vec3};
use scenegrid_wire::{CreateSceneInNodeProto, InstantiateInNodeProto, NodeId, WireError};

use crate::node::SceneTemplate;

/// Spawn an entity in a scene hosted by `target_node_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantiateRequest {
    pub target_node_id: NodeId,
    pub scene_name: String,
    /// Host-defined code selecting what to spawn.
    pub create_code: i32,
    /// Opaque state handed to the spawned entity.
    pub behavior_data: Vec<u8>,
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub send_transform: bool,
}

/// Create a dynamic scene on `target_node_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSceneRequest {
    pub target_node_id: NodeId,
    pub template: SceneTemplate,
    /// Replace the bind ips with the target's authority addresses.
    pub auto_assign_ip: bool,
    /// Replace the ports with the target's next free dynamic port.
    pub auto_assign_port: bool,
    pub scene_meta_data: Vec<u8>,
}

/// Scene and entity lifecycle owned by the node process.
pub trait SceneHost {
    /// Spawn the requested entity. Returns false if the scene is unknown or
    /// the spawn failed.
    fn instantiate_in_scene(&mut self, request: &InstantiateRequest) -> bool;

    /// Create and start a dynamic scene from `template`.
    fn create_scene(&mut self, template: SceneTemplate, meta_data: &[u8]) -> bool;

    /// Next free dynamic port, without claiming it.
    fn peek_dynamic_port(&self) -> Option<u16>;
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&InstantiateRequest> for InstantiateInNodeProto {
    fn from(r: &InstantiateRequest) -> Self {
        Self {
            target_node_id: r.target_node_id,
            scene_name: r.scene_name.clone(),
            create_code: r.create_code,
            behavior_data: r.behavior_data.clone(),
            position: r.position.map(Into::into),
            rotation: r.rotation.map(Into::into),
            send_transform: r.send_transform,
        }
    }
}

impl From<InstantiateInNodeProto> for InstantiateRequest {
    fn from(r: InstantiateInNodeProto) -> Self {
        Self {
            target_node_id: r.target_node_id,
            scene_name: r.scene_name,
            create_code: r.create_code,
            behavior_data: r.behavior_data,
            position: r.position.map(Into::into),
            rotation: r.rotation.map(Into::into),
            send_transform: r.send_transform,
        }
    }
}

impl From<&CreateSceneRequest> for CreateSceneInNodeProto {
    fn from(r: &CreateSceneRequest) -> Self {
        Self {
            target_node_id: r.target_node_id,
            template: Some((&r.template).into()),
            auto_assign_ip: r.auto_assign_ip,
            auto_assign_port: r.auto_assign_port,
            scene_meta_data: r.scene_meta_data.clone(),
        }
    }
}

impl TryFrom<CreateSceneInNodeProto> for CreateSceneRequest {
    type Error = WireError;

    fn try_from(r: CreateSceneInNodeProto) -> Result<Self, Self::Error> {
        let template = r.template.ok_or(WireError::MissingField("template"))?;
        Ok(Self {
            target_node_id: r.target_node_id,
            template: template.try_into()?,
            auto_assign_ip: r.auto_assign_ip,
            auto_assign_port: r.auto_assign_port,
            scene_meta_data: r.scene_meta_data,
        })
    }
}
