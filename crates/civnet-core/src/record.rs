use serde::{Deserialize, Serialize};
use std::fmt;

use crate::multiaddr::{Multiaddr, MultiaddrExt};
use crate::types::PeerId;

/// Where a peer record came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoverySource {
    /// The static bootstrap list in the node configuration.
    Bootstrap,
    /// Supplied directly by the application (`Node::dial`).
    Manual,
    /// Learned from a connection the remote peer opened to us.
    Inbound,
    /// Listen addresses a connected peer advertised during identify.
    Identify,
    /// Any other discovery strategy, by name.
    Other(String),
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoverySource::Bootstrap => f.write_str("bootstrap"),
            DiscoverySource::Manual => f.write_str("manual"),
            DiscoverySource::Inbound => f.write_str("inbound"),
            DiscoverySource::Identify => f.write_str("identify"),
            DiscoverySource::Other(name) => f.write_str(name),
        }
    }
}

/// A dialable peer candidate.
///
/// `peer_id` is `None` when the address carried no `/p2p` suffix; such a
/// record is dialed without identity pinning and the id is learned from the
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: Option<PeerId>,
    /// Ordered, duplicate-free. Stored without `/p2p` suffixes.
    pub addrs: Vec<Multiaddr>,
    pub source: DiscoverySource,
}

impl PeerRecord {
    pub fn new(peer_id: Option<PeerId>, source: DiscoverySource) -> Self {
        Self { peer_id, addrs: Vec::new(), source }
    }

    /// Build a record from a single address, taking the peer id from its
    /// `/p2p` suffix when present.
    pub fn from_addr(addr: Multiaddr, source: DiscoverySource) -> Self {
        let mut record = Self::new(addr.peer_id(), source);
        record.add_addr(addr);
        record
    }

    /// Add an address; returns `false` if it was already known.
    pub fn add_addr(&mut self, addr: Multiaddr) -> bool {
        let addr = addr.without_peer_id();
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }

    /// Merge another sighting of the same peer. Returns the number of
    /// addresses that were new.
    pub fn merge(&mut self, other: &PeerRecord) -> usize {
        other.addrs.iter().filter(|a| self.add_addr((*a).clone())).count()
    }

    /// Label used in logs and events when the id is unknown.
    pub fn display_id(&self) -> String {
        match (&self.peer_id, self.addrs.first()) {
            (Some(id), _) => id.to_string(),
            (None, Some(addr)) => format!("<unknown@{addr}>"),
            (None, None) => "<unknown>".to_string(),
        }
    }
}
