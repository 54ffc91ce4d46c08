use std::fmt;

use civnet_core::types::{Direction, PeerId};
use civnet_core::{Multiaddr, PeerRecord};

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by this node (`hang_up` or `stop`).
    LocalClose,
    /// The remote closed the session, or it failed.
    RemoteClose,
    /// Evicted to make room for an inbound connection.
    Pruned,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisconnectReason::LocalClose => "local-close",
            DisconnectReason::RemoteClose => "remote-close",
            DisconnectReason::Pruned => "pruned",
        })
    }
}

/// Everything a node reports to its observers.
///
/// For any one peer the order is causal: discovery, then connect, then
/// disconnect. A peer that is still connected never gets a second connect.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDiscovery(PeerRecord),
    PeerConnect {
        peer: PeerId,
        addr: Multiaddr,
        direction: Direction,
    },
    PeerDisconnect {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// A dial ended without a connection. `peer` is `None` for dials to an
    /// address whose owner was not known up front.
    PeerDialFailure {
        peer: Option<PeerId>,
        addr: Option<Multiaddr>,
        error: String,
    },
}

impl NodeEvent {
    /// Wire-style event name, e.g. `peer:connect`.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::PeerDiscovery(_) => "peer:discovery",
            NodeEvent::PeerConnect { .. } => "peer:connect",
            NodeEvent::PeerDisconnect { .. } => "peer:disconnect",
            NodeEvent::PeerDialFailure { .. } => "peer:dial-failure",
        }
    }

    pub fn peer(&self) -> Option<PeerId> {
        match self {
            NodeEvent::PeerDiscovery(record) => record.peer_id,
            NodeEvent::PeerConnect { peer, .. } | NodeEvent::PeerDisconnect { peer, .. } => Some(*peer),
            NodeEvent::PeerDialFailure { peer, .. } => *peer,
        }
    }
}
