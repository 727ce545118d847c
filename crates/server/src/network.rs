//! In-memory network.
//!
//! Routes payloads between the node processes of one cluster without any
//! socket I/O, so whole clusters run deterministically inside a test.
//!
//! Every peer owns an inbox. A send is held in flight for the configured
//! latency and moves to the addressee's inbox on [`MemoryNetwork::advance`].
//! Reliable payloads arrive once and in send order. Unreliable payloads that
//! become deliverable in the same advance form a batch that
//! [`UnreliableDelivery`] may drop or reverse.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::rc::Rc;

use log::{debug, info, trace};
use scenegrid_util::{DeltaDelay, Seconds};
use scenegrid_wire::{Channel, Incoming, PeerId, Target, Transport};

/// Treatment of unreliable batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnreliableDelivery {
    #[default]
    InOrder,
    Drop,
    Reverse,
}

/// Conditions applied to every link of the network.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkConditions {
    /// One-way delay of every payload.
    pub latency: Seconds,
    pub unreliable: UnreliableDelivery,
}

struct InFlight {
    channel: Channel,
    delay: DeltaDelay,
    incoming: Incoming,
}

struct PeerLink {
    connected: bool,
    in_flight: Vec<InFlight>,
    inbox: VecDeque<Incoming>,
}

impl PeerLink {
    fn new() -> Self {
        Self {
            connected: true,
            in_flight: Vec::new(),
            inbox: VecDeque::new(),
        }
    }
}

struct NetworkState {
    authority: PeerId,
    conditions: LinkConditions,
    peers: BTreeMap<PeerId, PeerLink>,
    /// Disconnect notifications not yet taken by the authority.
    disconnected: Vec<PeerId>,
    dropped: usize,
}

impl NetworkState {
    fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|link| link.connected)
    }

    fn route(&mut self, from: PeerId, target: Target, channel: Channel, payload: Vec<u8>) {
        if !self.is_connected(from) {
            trace!("peer {} is disconnected, send dropped", from);
            self.dropped += 1;
            return;
        }

        let destinations: Vec<PeerId> = match target {
            Target::Server => vec![self.authority],
            Target::Player(peer) => vec![peer],
            Target::All => self
                .peers
                .keys()
                .copied()
                .filter(|peer| *peer != from)
                .collect(),
        };

        let latency = self.conditions.latency;
        for peer in destinations {
            let Some(link) = self.peers.get_mut(&peer).filter(|link| link.connected) else {
                trace!("peer {} unreachable from {}", peer, from);
                self.dropped += 1;
                continue;
            };
            link.in_flight.push(InFlight {
                channel,
                delay: DeltaDelay::new(latency),
                incoming: Incoming {
                    from,
                    payload: payload.clone(),
                },
            });
        }
    }
}

/// Shared handle to one in-memory network.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    /// Create a network whose `Target::Server` is `authority`.
    pub fn new(authority: PeerId, conditions: LinkConditions) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetworkState {
                authority,
                conditions,
                peers: BTreeMap::new(),
                disconnected: Vec::new(),
                dropped: 0,
            })),
        }
    }

    /// Attach `peer` and return its transport. Attaching a known peer
    /// reconnects it with an empty inbox.
    pub fn endpoint(&self, peer: PeerId) -> MemoryEndpoint {
        self.state.borrow_mut().peers.insert(peer, PeerLink::new());
        MemoryEndpoint {
            peer,
            state: Rc::clone(&self.state),
        }
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.state.borrow_mut().conditions = conditions;
    }

    pub fn conditions(&self) -> LinkConditions {
        self.state.borrow().conditions
    }

    /// Let `dt` pass on every link and deliver what is due.
    pub fn advance(&self, dt: Seconds) {
        let state = &mut *self.state.borrow_mut();
        let mode = state.conditions.unreliable;

        for (peer, link) in state.peers.iter_mut() {
            let mut unreliable = Vec::new();
            let mut reliable_blocked = false;

            for mut message in mem::take(&mut link.in_flight) {
                message.delay.update(dt);
                let due = message.delay.has_passed();
                match message.channel {
                    Channel::Reliable if due && !reliable_blocked => {
                        link.inbox.push_back(message.incoming)
                    }
                    Channel::Reliable => {
                        reliable_blocked = true;
                        link.in_flight.push(message);
                    }
                    Channel::Unreliable if due => unreliable.push(message.incoming),
                    Channel::Unreliable => link.in_flight.push(message),
                }
            }

            if unreliable.is_empty() {
                continue;
            }
            match mode {
                UnreliableDelivery::InOrder => link.inbox.extend(unreliable),
                UnreliableDelivery::Reverse => link.inbox.extend(unreliable.into_iter().rev()),
                UnreliableDelivery::Drop => {
                    debug!("dropped {} unreliable payloads to peer {}", unreliable.len(), peer);
                    state.dropped += unreliable.len();
                }
            }
        }
    }

    /// Cut `peer` off. Queued payloads to it are discarded and the authority
    /// is notified through [`MemoryNetwork::take_disconnected`].
    pub fn disconnect(&self, peer: PeerId) -> bool {
        let state = &mut *self.state.borrow_mut();
        let Some(link) = state.peers.get_mut(&peer) else {
            return false;
        };
        if !link.connected {
            return false;
        }

        link.connected = false;
        state.dropped += link.in_flight.len() + link.inbox.len();
        link.in_flight.clear();
        link.inbox.clear();
        state.disconnected.push(peer);
        info!("peer {} disconnected", peer);
        true
    }

    /// Disconnect notifications for the authority, oldest first.
    pub fn take_disconnected(&self) -> Vec<PeerId> {
        mem::take(&mut self.state.borrow_mut().disconnected)
    }

    /// Whether no payload is in flight or waiting in an inbox.
    pub fn is_idle(&self) -> bool {
        self.state
            .borrow()
            .peers
            .values()
            .all(|link| link.in_flight.is_empty() && link.inbox.is_empty())
    }

    /// Payloads lost to disconnects or [`UnreliableDelivery::Drop`].
    pub fn dropped(&self) -> usize {
        self.state.borrow().dropped
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    peer: PeerId,
    state: Rc<RefCell<NetworkState>>,
}

impl Transport for MemoryEndpoint {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn is_connected(&self) -> bool {
        let state = self.state.borrow();
        state.is_connected(self.peer) && state.is_connected(state.authority)
    }

    fn send(&mut self, target: Target, channel: Channel, payload: Vec<u8>) {
        self.state
            .borrow_mut()
            .route(self.peer, target, channel, payload);
    }

    fn receive(&mut self) -> Option<Incoming> {
        self.state
            .borrow_mut()
            .peers
            .get_mut(&self.peer)
            .and_then(|link| link.inbox.pop_front())
    }
}
