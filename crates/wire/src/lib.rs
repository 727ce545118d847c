//! Scenegrid Wire Protocol Types
//!
//! This crate defines the Protobuf messages exchanged between node processes
//! and the [`Transport`] contract they are sent over. Every payload travels
//! inside an [`Envelope`] whose `kind` selects the handler on the receiving
//! side.
//!
//! # Message Categories
//!
//! - **Directory** (reliable + ordered): node/scene registration, lookup,
//!   cross-node instantiate and create-scene relays. Payload is always a
//!   [`ServiceCallbackProto`] whose `data` carries the request or response.
//! - **Prediction**: input frames to the authority (reliable) and the
//!   authority's play history back to the owner (unreliable).

#![deny(unsafe_code)]

pub mod transport;

use prost::Message;
use scenegrid_sim::{ActionFrame, InputFrame, InputHistoryItem, Quat, Vec3};
use thiserror::Error;

pub use transport::{Channel, Incoming, PeerId, Target, Transport};

// ============================================================================
// Type Aliases
// ============================================================================

/// Cluster-wide node identifier. 0 means "no node".
pub type NodeId = u32;

/// Correlation id of a pending directory request.
pub type CallbackId = u32;

/// Identifier of a networked entity within a node process.
pub type EntityId = u64;

// ============================================================================
// Errors
// ============================================================================

/// Failure to interpret bytes received from the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("unknown message kind {0}")]
    UnknownKind(i32),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

// ============================================================================
// Envelope
// ============================================================================

/// Message kind carried by an [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Unspecified = 0,

    // Directory
    RegisterNode = 1,
    RegisterScene = 2,
    UnregisterScene = 3,
    ConfirmScene = 4,
    LookupScene = 5,
    ReceiveLookupScene = 6,
    RelayInstantiateInNode = 7,
    InstantiateInNode = 8,
    RelayConfirmInstantiateInNode = 9,
    ConfirmInstantiateInNode = 10,
    RelayCreateSceneInNode = 11,
    CreateSceneInNode = 12,
    RelayConfirmCreateSceneInNode = 13,
    ConfirmCreateSceneInNode = 14,

    // Prediction
    SyncInputs = 20,
    SyncInputHistory = 21,
}

impl MessageKind {
    pub fn is_directory(self) -> bool {
        (Self::RegisterNode as i32..=Self::ConfirmCreateSceneInNode as i32).contains(&(self as i32))
    }

    pub fn is_prediction(self) -> bool {
        matches!(self, Self::SyncInputs | Self::SyncInputHistory)
    }
}

/// Outer frame of every message on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageKind", tag = "1")]
    pub kind: i32,

    /// Addressed entity for prediction messages; 0 for directory messages.
    #[prost(uint64, tag = "2")]
    pub entity_id: EntityId,

    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new<M: Message>(kind: MessageKind, entity_id: EntityId, message: &M) -> Self {
        Self {
            kind: kind as i32,
            entity_id,
            payload: message.encode_to_vec(),
        }
    }

    /// Decode an envelope from raw transport bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(Self::decode(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// The kind, rejecting values this build does not know.
    pub fn message_kind(&self) -> Result<MessageKind, WireError> {
        match MessageKind::try_from(self.kind) {
            Ok(MessageKind::Unspecified) | Err(_) => Err(WireError::UnknownKind(self.kind)),
            Ok(kind) => Ok(kind),
        }
    }

    pub fn decode_payload<M: Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.payload.as_slice())?)
    }
}

// ============================================================================
// Directory Messages
// ============================================================================

/// Outcome of a directory request.
///
/// Returned by every directory entry point; failures are states, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CallbackState {
    None = 0,
    AwaitingResponse = 1,
    ResponseSuccess = 2,
    ResponseFailed = 3,
    ErrorTimeout = 4,
    ErrorServiceNotInitialized = 5,
    ErrorNoConnection = 6,
    ErrorNoData = 7,
}

impl CallbackState {
    /// True for every state that ends a request.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::None | Self::AwaitingResponse)
    }

    pub fn is_success(self) -> bool {
        self == Self::ResponseSuccess
    }
}

/// Correlated request/response frame for all directory traffic.
#[derive(Clone, PartialEq, Message)]
pub struct ServiceCallbackProto {
    /// Correlation id; 0 when no reply is expected.
    #[prost(uint32, tag = "1")]
    pub callback_id: CallbackId,

    /// Node that issued the request.
    #[prost(uint32, tag = "2")]
    pub source_node_id: NodeId,

    #[prost(enumeration = "CallbackState", tag = "3")]
    pub state: i32,

    /// Encoded request or response body.
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,

    /// Whether the requester wants a confirmation reply.
    #[prost(bool, tag = "5")]
    pub require_confirmation: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct EndpointProto {
    #[prost(string, tag = "1")]
    pub ip: String,

    /// Port, widened to u32 for protobuf.
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SceneSettingsProto {
    #[prost(uint32, tag = "1")]
    pub max_connections: u32,

    #[prost(bool, tag = "2")]
    pub use_tcp: bool,

    #[prost(message, optional, tag = "3")]
    pub server_address: Option<EndpointProto>,

    #[prost(message, optional, tag = "4")]
    pub server_nat_address: Option<EndpointProto>,

    #[prost(message, optional, tag = "5")]
    pub client_address: Option<EndpointProto>,

    #[prost(message, optional, tag = "6")]
    pub client_nat_address: Option<EndpointProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SceneTemplateProto {
    /// Build/resource index; negative when the scene is created empty.
    #[prost(int32, tag = "1")]
    pub build_index: i32,

    #[prost(string, tag = "2")]
    pub scene_name: String,

    #[prost(message, optional, tag = "3")]
    pub scene_offset: Option<Vec3Proto>,

    #[prost(message, optional, tag = "4")]
    pub settings: Option<SceneSettingsProto>,
}

/// Lookup reply body: the hosting node and its template.
///
/// `node_id == 0` signals that the scene is not registered.
#[derive(Clone, PartialEq, Message)]
pub struct NodeSceneTemplateProto {
    #[prost(uint32, tag = "1")]
    pub node_id: NodeId,

    #[prost(message, optional, tag = "2")]
    pub template: Option<SceneTemplateProto>,
}

/// Body of `UnregisterScene` and `LookupScene`.
#[derive(Clone, PartialEq, Message)]
pub struct SceneNameProto {
    #[prost(string, tag = "1")]
    pub scene_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct InstantiateInNodeProto {
    #[prost(uint32, tag = "1")]
    pub target_node_id: NodeId,

    #[prost(string, tag = "2")]
    pub scene_name: String,

    /// Host-defined code selecting what to spawn.
    #[prost(int32, tag = "3")]
    pub create_code: i32,

    #[prost(bytes = "vec", tag = "4")]
    pub behavior_data: Vec<u8>,

    #[prost(message, optional, tag = "5")]
    pub position: Option<Vec3Proto>,

    #[prost(message, optional, tag = "6")]
    pub rotation: Option<QuatProto>,

    #[prost(bool, tag = "7")]
    pub send_transform: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct CreateSceneInNodeProto {
    #[prost(uint32, tag = "1")]
    pub target_node_id: NodeId,

    #[prost(message, optional, tag = "2")]
    pub template: Option<SceneTemplateProto>,

    #[prost(bool, tag = "3")]
    pub auto_assign_ip: bool,

    #[prost(bool, tag = "4")]
    pub auto_assign_port: bool,

    #[prost(bytes = "vec", tag = "5")]
    pub scene_meta_data: Vec<u8>,
}

// ============================================================================
// Spatial Messages
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct Vec3Proto {
    #[prost(double, tag = "1")]
    pub x: f64,

    #[prost(double, tag = "2")]
    pub y: f64,

    #[prost(double, tag = "3")]
    pub z: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuatProto {
    #[prost(double, tag = "1")]
    pub x: f64,

    #[prost(double, tag = "2")]
    pub y: f64,

    #[prost(double, tag = "3")]
    pub z: f64,

    #[prost(double, tag = "4")]
    pub w: f64,
}

// ============================================================================
// Prediction Messages
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct ActionFrameProto {
    /// Action code, widened to u32 for protobuf.
    #[prost(uint32, tag = "1")]
    pub action_id: u32,

    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InputFrameProto {
    #[prost(uint32, tag = "1")]
    pub frame: u32,

    #[prost(double, tag = "2")]
    pub horizontal: f64,

    #[prost(double, tag = "3")]
    pub vertical: f64,

    #[prost(message, repeated, tag = "4")]
    pub actions: Vec<ActionFrameProto>,
}

/// Owner → authority batch of saved frames.
#[derive(Clone, PartialEq, Message)]
pub struct InputFramesProto {
    #[prost(message, repeated, tag = "1")]
    pub frames: Vec<InputFrameProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InputHistoryItemProto {
    #[prost(message, optional, tag = "1")]
    pub position: Option<Vec3Proto>,

    #[prost(message, optional, tag = "2")]
    pub input: Option<InputFrameProto>,
}

/// Authority → owner batch of played history, oldest first.
#[derive(Clone, PartialEq, Message)]
pub struct InputHistoryProto {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<InputHistoryItemProto>,
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<Vec3> for Vec3Proto {
    fn from(v: Vec3) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl From<Vec3Proto> for Vec3 {
    fn from(v: Vec3Proto) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<Quat> for QuatProto {
    fn from(q: Quat) -> Self {
        Self {
            x: q.x,
            y: q.y,
            z: q.z,
            w: q.w,
        }
    }
}

impl From<QuatProto> for Quat {
    fn from(q: QuatProto) -> Self {
        Self {
            x: q.x,
            y: q.y,
            z: q.z,
            w: q.w,
        }
    }
}

impl From<&ActionFrame> for ActionFrameProto {
    fn from(a: &ActionFrame) -> Self {
        Self {
            action_id: u32::from(a.action_id),
            data: a.data.clone(),
        }
    }
}

impl TryFrom<ActionFrameProto> for ActionFrame {
    type Error = WireError;

    fn try_from(a: ActionFrameProto) -> Result<Self, Self::Error> {
        let action_id = u8::try_from(a.action_id).map_err(|_| WireError::OutOfRange {
            field: "action_id",
            value: u64::from(a.action_id),
        })?;
        Ok(Self::new(action_id, a.data))
    }
}

impl From<&InputFrame> for InputFrameProto {
    fn from(f: &InputFrame) -> Self {
        Self {
            frame: f.frame,
            horizontal: f.horizontal,
            vertical: f.vertical,
            actions: f.actions.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<InputFrameProto> for InputFrame {
    type Error = WireError;

    fn try_from(f: InputFrameProto) -> Result<Self, Self::Error> {
        let actions: Result<Vec<_>, _> = f.actions.into_iter().map(TryInto::try_into).collect();
        Ok(Self {
            frame: f.frame,
            horizontal: f.horizontal,
            vertical: f.vertical,
            actions: actions?,
        })
    }
}

impl From<&InputHistoryItem> for InputHistoryItemProto {
    fn from(item: &InputHistoryItem) -> Self {
        Self {
            position: Some(item.position.into()),
            input: Some((&item.input).into()),
        }
    }
}

impl TryFrom<InputHistoryItemProto> for InputHistoryItem {
    type Error = WireError;

    fn try_from(item: InputHistoryItemProto) -> Result<Self, Self::Error> {
        let position = item.position.ok_or(WireError::MissingField("position"))?;
        let input = item.input.ok_or(WireError::MissingField("input"))?;
        Ok(Self {
            position: position.into(),
            input: input.try_into()?,
        })
    }
}

impl InputFramesProto {
    pub fn from_frames(frames: &[InputFrame]) -> Self {
        Self {
            frames: frames.iter().map(Into::into).collect(),
        }
    }

    pub fn into_frames(self) -> Result<Vec<InputFrame>, WireError> {
        self.frames.into_iter().map(TryInto::try_into).collect()
    }
}

impl InputHistoryProto {
    pub fn from_items(items: &[InputHistoryItem]) -> Self {
        Self {
            items: items.iter().map(Into::into).collect(),
        }
    }

    pub fn into_items(self) -> Result<Vec<InputHistoryItem>, WireError> {
        self.items.into_iter().map(TryInto::try_into).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
