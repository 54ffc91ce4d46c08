use std::sync::Arc;
use std::time::{Duration, Instant};

use civnet_core::types::{Direction, PeerId};
use civnet_core::Multiaddr;

use crate::identify::IdentifyInfo;
use crate::mux::{MuxError, MuxStream, MuxedSession};

/// An established, authenticated, multiplexed link to one remote peer.
///
/// Once registered, a connection is owned by the `ConnectionManager`.
pub struct Connection {
    remote_peer: PeerId,
    /// Known for inbound connections; the local end of a dial is not exposed
    /// by every transport.
    local_addr: Option<Multiaddr>,
    remote_addr: Multiaddr,
    direction: Direction,
    session: Arc<dyn MuxedSession>,
    /// What the remote announced about itself, if identify ran.
    identify: Option<IdentifyInfo>,
    established: Instant,
}

impl Connection {
    pub fn new(
        remote_peer: PeerId,
        local_addr: Option<Multiaddr>,
        remote_addr: Multiaddr,
        direction: Direction,
        session: Arc<dyn MuxedSession>,
    ) -> Self {
        Self {
            remote_peer,
            local_addr,
            remote_addr,
            direction,
            session,
            identify: None,
            established: Instant::now(),
        }
    }

    pub fn with_identify(mut self, info: IdentifyInfo) -> Self {
        self.identify = Some(info);
        self
    }

    pub fn identify(&self) -> Option<&IdentifyInfo> {
        self.identify.as_ref()
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn local_addr(&self) -> Option<&Multiaddr> {
        self.local_addr.as_ref()
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session(&self) -> &Arc<dyn MuxedSession> {
        &self.session
    }

    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        self.session.last_activity()
    }

    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        self.session.open_stream().await
    }

    pub async fn ping(&self) -> Result<Duration, MuxError> {
        self.session.ping().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .finish()
    }
}
