use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use civnet_core::types::{Direction, PeerId};
use civnet_core::{Multiaddr, MultiaddrExt};
use civnet_crypto::PeerIdentity;
use tracing::debug;

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::error::UpgradeError;
use crate::identify::{self, IdentifyInfo};
use crate::mux::Multiplexer;
use crate::secure::{Negotiator, SecureChannel};
use crate::transport::{Inbound, TransportRegistry};

/// Runs the transport → security → identify → mux chain in either direction.
///
/// Every stage owns its stream by value, so an error or a cancelled future
/// drops the partially upgraded stream on the spot.
#[derive(Clone)]
pub struct Upgrader {
    identity: Arc<PeerIdentity>,
    transports: TransportRegistry,
    negotiator: Negotiator,
    multiplexer: Multiplexer,
    dial_timeout: Duration,
    /// Announced to every peer during identify.
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
}

impl Upgrader {
    pub fn new(identity: Arc<PeerIdentity>, transports: TransportRegistry, config: &NodeConfig) -> Self {
        Self {
            identity,
            transports,
            negotiator: Negotiator::new(config.handshake_timeout()),
            multiplexer: Multiplexer::new(config.mux.clone()),
            dial_timeout: config.dial_timeout(),
            listen_addrs: Arc::default(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.listen_addrs.lock().unwrap_or_else(PoisonError::into_inner) = addrs;
    }

    /// Dial `addr` and upgrade the result. With `expected` set, the remote
    /// must prove that identity.
    pub async fn dial(&self, addr: &Multiaddr, expected: Option<PeerId>) -> Result<Connection, UpgradeError> {
        let stream = self.transports.dial(addr, self.dial_timeout).await?;
        let channel = self
            .negotiator
            .upgrade(stream, &self.identity, Direction::Outbound, expected)
            .await?;
        self.finish(channel, None, addr.without_peer_id(), Direction::Outbound).await
    }

    /// Upgrade a stream accepted by a listener.
    pub async fn accept(&self, inbound: Inbound) -> Result<Connection, UpgradeError> {
        let Inbound { stream, local_addr, remote_addr } = inbound;
        let channel = self
            .negotiator
            .upgrade(stream, &self.identity, Direction::Inbound, None)
            .await?;
        self.finish(channel, Some(local_addr), remote_addr, Direction::Inbound).await
    }

    async fn finish(
        &self,
        mut channel: SecureChannel,
        local_addr: Option<Multiaddr>,
        remote_addr: Multiaddr,
        direction: Direction,
    ) -> Result<Connection, UpgradeError> {
        let remote = channel.remote_peer();
        if remote == self.local_peer() {
            return Err(UpgradeError::SelfConnection);
        }
        let local = IdentifyInfo::new(self.listen_addrs());
        let info = identify::exchange(&mut channel, &local, self.negotiator.handshake_timeout()).await?;
        debug!(
            peer = %remote,
            agent = %info.agent_version,
            protocol = %info.protocol_version,
            addrs = info.listen_addrs.len(),
            "identified"
        );
        let session = self.multiplexer.upgrade(channel, direction);
        debug!(peer = %remote, addr = %remote_addr, %direction, "connection upgraded");
        Ok(Connection::new(remote, local_addr, remote_addr, direction, Arc::new(session)).with_identify(info))
    }
}
