//! Self-describing network addresses.
//!
//! Addresses are `multiaddr::Multiaddr` values, e.g.
//! `/ip4/127.0.0.1/tcp/7777/p2p/<peer-id>`. A civnet `PeerId` travels in the
//! `/p2p` component as an identity multihash of its 32 bytes, so the text
//! after `/p2p/` is exactly the peer id's `Display` form.

use std::net::{IpAddr, SocketAddr};

pub use multiaddr::{Error as MultiaddrError, Multiaddr, Protocol};

use crate::error::PeerIdError;
use crate::types::PeerId;

/// Parse `text`, rejecting the empty address.
pub fn parse(text: &str) -> Result<Multiaddr, MultiaddrError> {
    let addr: Multiaddr = text.parse()?;
    if addr.is_empty() {
        return Err(MultiaddrError::InvalidMultiaddr);
    }
    Ok(addr)
}

/// civnet helpers on top of `Multiaddr`.
pub trait MultiaddrExt: Sized {
    /// `/memory/<port>`
    fn memory(port: u64) -> Self;

    /// `/ip4|ip6/<ip>/tcp/<port>`
    fn from_socket(addr: SocketAddr) -> Self;

    /// The peer id in a trailing `/p2p` component, if any.
    fn peer_id(&self) -> Option<PeerId>;

    /// This address with any trailing `/p2p` component removed.
    fn without_peer_id(&self) -> Self;

    /// This address with its trailing `/p2p` component replaced by `peer`.
    fn with_peer_id(&self, peer: PeerId) -> Self;
}

impl MultiaddrExt for Multiaddr {
    fn memory(port: u64) -> Self {
        Multiaddr::empty().with(Protocol::Memory(port))
    }

    fn from_socket(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
    }

    fn peer_id(&self) -> Option<PeerId> {
        match self.iter().last() {
            Some(Protocol::P2p(id)) => PeerId::try_from(id).ok(),
            _ => None,
        }
    }

    fn without_peer_id(&self) -> Self {
        let mut addr = self.clone();
        if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
            addr.pop();
        }
        addr
    }

    fn with_peer_id(&self, peer: PeerId) -> Self {
        self.without_peer_id().with(Protocol::P2p(peer.into()))
    }
}

impl From<PeerId> for libp2p_identity::PeerId {
    fn from(peer: PeerId) -> Self {
        libp2p_identity::PeerId::from_bytes(&peer.to_multihash())
            .expect("identity multihash of a 32-byte id is a valid peer id")
    }
}

impl TryFrom<libp2p_identity::PeerId> for PeerId {
    type Error = PeerIdError;

    fn try_from(id: libp2p_identity::PeerId) -> Result<Self, Self::Error> {
        PeerId::from_multihash(&id.to_bytes())
    }
}
