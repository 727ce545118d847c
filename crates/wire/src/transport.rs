//! Transport contract.
//!
//! The remote-call facility is a collaborator, not part of this workspace's
//! core. Components depend only on this trait; a node process supplies the
//! concrete implementation (the in-memory network in tests).
//!
//! Delivery semantics per channel:
//! - [`Channel::Reliable`]: delivered once, in send order, or the peer is
//!   disconnected
//! - [`Channel::Unreliable`]: may be dropped or reordered

/// Network handle of a connected process.
pub type PeerId = u64;

/// Delivery guarantee requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Addressee of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The authority process.
    Server,
    /// One connected peer.
    Player(PeerId),
    /// Every connected peer except the sender.
    All,
}

/// A received payload with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Send/receive capability of one process.
pub trait Transport {
    /// This process's own peer handle.
    fn local_peer(&self) -> PeerId;

    /// Whether a live connection to the authority exists. Always true on the
    /// authority itself while it is serving.
    fn is_connected(&self) -> bool;

    fn send(&mut self, target: Target, channel: Channel, payload: Vec<u8>);

    /// Next payload delivered to this process, if any.
    fn receive(&mut self) -> Option<Incoming>;
}
