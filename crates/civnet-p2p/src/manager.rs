//! Connection bookkeeping and dial policy.
//!
//! Each tracked peer moves through
//!
//! ```text
//!   Disconnected ──request_dial──▶ Dialing ──upgrade ok──▶ Connected
//!        ▲                            │                       │
//!        └──────── dial failed ───────┘        close ──▶ Closing ──▶ Disconnected
//! ```
//!
//! All transitions happen under one mutex and every event is broadcast
//! while that mutex is held, so per-peer events come out in causal order.
//! The mutex is never held across an `.await`.
//!
//! Capacity counts Dialing, Connected and Closing peers together, so a slot
//! is taken the moment a dial is requested and `max_connections` is never
//! overshot, not even transiently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use civnet_core::types::{Direction, PeerId};
use civnet_core::{Multiaddr, PeerRecord};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::error::NodeError;
use crate::event::{DisconnectReason, NodeEvent};
use crate::mux::MuxStream;
use crate::transport::Inbound;
use crate::upgrade::Upgrader;

/// Error text of a dial that was aborted before it finished.
pub const DIAL_CANCELLED: &str = "dial cancelled";

/// Result of `ConnectionManager::request_dial`.
#[derive(Debug)]
pub enum DialRequest {
    /// A dial task was spawned. Aborting it cancels the dial.
    Started(JoinHandle<()>),
    AlreadyConnected,
    DialInProgress,
    /// Every slot is taken by live or in-flight connections.
    AtCapacity,
    SelfDial,
    NoAddress,
}

impl DialRequest {
    pub fn is_started(&self) -> bool {
        matches!(self, DialRequest::Started(_))
    }
}

/// Result of `ConnectionManager::on_inbound_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Accepted,
    /// Accepted after evicting the least recently active peer.
    AcceptedAfterPrune(PeerId),
    /// Already connected to that peer; the new connection was closed.
    Duplicate,
    /// Full, and no connected peer could be pruned.
    AtCapacity,
}

/// A slot held by a dial in flight. `seq` tells successive dials to the
/// same key apart.
struct Reservation {
    seq: u64,
    abort: Option<AbortHandle>,
}

impl Reservation {
    fn cancel(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

enum PeerSlot {
    Dialing(Reservation),
    Connected(Arc<Connection>),
    Closing(Arc<Connection>),
}

/// What a dial reserved a slot under.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DialKey {
    Peer(PeerId),
    /// A record without a peer id, keyed by its first address.
    Address(Multiaddr),
}

#[derive(Default)]
struct ManagerState {
    peers: HashMap<PeerId, PeerSlot>,
    anonymous: HashMap<Multiaddr, Reservation>,
    next_seq: u64,
}

impl ManagerState {
    fn slots(&self) -> usize {
        self.peers.len() + self.anonymous.len()
    }

    fn connected(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.peers.values().filter_map(|slot| match slot {
            PeerSlot::Connected(conn) => Some(conn),
            _ => None,
        })
    }

    fn is_dialing(&self, key: &DialKey) -> bool {
        match key {
            DialKey::Peer(peer) => matches!(self.peers.get(peer), Some(PeerSlot::Dialing(_))),
            DialKey::Address(addr) => self.anonymous.contains_key(addr),
        }
    }

    fn reservation(&mut self, key: &DialKey) -> Option<&mut Reservation> {
        match key {
            DialKey::Peer(peer) => match self.peers.get_mut(peer) {
                Some(PeerSlot::Dialing(reservation)) => Some(reservation),
                _ => None,
            },
            DialKey::Address(addr) => self.anonymous.get_mut(addr),
        }
    }

    /// Take a slot for a new dial and return its sequence number.
    fn reserve(&mut self, key: &DialKey) -> u64 {
        self.next_seq += 1;
        let reservation = Reservation { seq: self.next_seq, abort: None };
        match key {
            DialKey::Peer(peer) => {
                self.peers.insert(*peer, PeerSlot::Dialing(reservation));
            }
            DialKey::Address(addr) => {
                self.anonymous.insert(addr.clone(), reservation);
            }
        }
        self.next_seq
    }

    /// Drop the reservation made by dial `seq`. Returns whether it was
    /// still held; a cancelled dial must not release a later one's slot.
    fn release(&mut self, key: &DialKey, seq: u64) -> bool {
        if self.reservation(key).map(|r| r.seq) != Some(seq) {
            return false;
        }
        match key {
            DialKey::Peer(peer) => {
                self.peers.remove(peer);
            }
            DialKey::Address(addr) => {
                self.anonymous.remove(addr);
            }
        }
        true
    }
}

/// Releases a dial reservation if the dial task is dropped before it
/// reports an outcome, e.g. when its `JoinHandle` is aborted.
struct DialGuard {
    manager: Weak<ConnectionManager>,
    key: DialKey,
    seq: u64,
    peer: Option<PeerId>,
    armed: bool,
}

impl DialGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let addr = match &self.key {
            DialKey::Address(addr) => Some(addr.clone()),
            DialKey::Peer(_) => None,
        };
        if let Some(manager) = self.manager.upgrade() {
            manager.fail_dial(&self.key, self.seq, self.peer, addr, DIAL_CANCELLED.to_string());
        }
    }
}

/// Tracks live connections and enforces the connection limits.
pub struct ConnectionManager {
    upgrader: Upgrader,
    min_connections: usize,
    max_connections: usize,
    close_timeout: Duration,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<NodeEvent>,
    inbound_streams: mpsc::Sender<(PeerId, MuxStream)>,
}

impl ConnectionManager {
    pub fn new(
        upgrader: Upgrader,
        config: &NodeConfig,
        events: broadcast::Sender<NodeEvent>,
        inbound_streams: mpsc::Sender<(PeerId, MuxStream)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            upgrader,
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            close_timeout: config.close_timeout(),
            state: Mutex::new(ManagerState::default()),
            events,
            inbound_streams,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: NodeEvent) {
        trace!(kind = event.kind(), "event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }

    pub fn local_peer(&self) -> PeerId {
        self.upgrader.local_peer()
    }

    // ── Dialing ──────────────────────────────────────────────────────────────

    /// Dial `record` unless it is pointless or over capacity.
    ///
    /// Never fails: the outcome of a started dial is reported through
    /// `peer:connect` or `peer:dial-failure`.
    pub fn request_dial(self: &Arc<Self>, record: PeerRecord) -> DialRequest {
        let Some(first_addr) = record.addrs.first().cloned() else {
            return DialRequest::NoAddress;
        };
        let key = match record.peer_id {
            Some(peer) if peer == self.local_peer() => return DialRequest::SelfDial,
            Some(peer) => DialKey::Peer(peer),
            None => DialKey::Address(first_addr),
        };

        let mut state = self.lock();
        if let DialKey::Peer(peer) = &key {
            match state.peers.get(peer) {
                Some(PeerSlot::Dialing(_)) => return DialRequest::DialInProgress,
                Some(_) => return DialRequest::AlreadyConnected,
                None => {}
            }
        } else if state.is_dialing(&key) {
            return DialRequest::DialInProgress;
        }
        if state.slots() >= self.max_connections {
            debug!(peer = %record.display_id(), max = self.max_connections, "dial skipped, at capacity");
            return DialRequest::AtCapacity;
        }

        let seq = state.reserve(&key);
        let guard = DialGuard {
            manager: Arc::downgrade(self),
            key: key.clone(),
            seq,
            peer: record.peer_id,
            armed: true,
        };
        debug!(peer = %record.display_id(), addrs = record.addrs.len(), "dialing");
        let handle = tokio::spawn(self.clone().run_dial(record, guard));
        if let Some(reservation) = state.reservation(&key) {
            reservation.abort = Some(handle.abort_handle());
        }
        DialRequest::Started(handle)
    }

    async fn run_dial(self: Arc<Self>, record: PeerRecord, mut guard: DialGuard) {
        let mut last_failure = None;
        for addr in &record.addrs {
            match self.upgrader.dial(addr, record.peer_id).await {
                Ok(conn) => {
                    guard.disarm();
                    self.finish_dial(&guard.key, guard.seq, conn);
                    return;
                }
                Err(e) => {
                    debug!(peer = %record.display_id(), %addr, error = %e, "dial attempt failed");
                    last_failure = Some((addr.clone(), e.to_string()));
                }
            }
        }
        guard.disarm();
        let (addr, error) = match last_failure {
            Some((addr, error)) => (Some(addr), error),
            None => (None, "no dialable address".to_string()),
        };
        self.fail_dial(&guard.key, guard.seq, record.peer_id, addr, error);
    }

    fn fail_dial(
        &self,
        key: &DialKey,
        seq: u64,
        peer: Option<PeerId>,
        addr: Option<Multiaddr>,
        error: String,
    ) {
        let mut state = self.lock();
        // Without a reservation the dial was superseded (an inbound connection
        // from the same peer) or cancelled by `close_all`: nothing to report.
        if !state.release(key, seq) {
            return;
        }
        info!(peer = ?peer, error = %error, "dial failed");
        self.emit(NodeEvent::PeerDialFailure { peer, addr, error });
    }

    fn finish_dial(self: &Arc<Self>, key: &DialKey, seq: u64, conn: Connection) {
        let peer = conn.remote_peer();
        let mut state = self.lock();
        if !state.release(key, seq) {
            drop(state);
            debug!(%peer, "dial completed after cancellation, closing");
            self.spawn_close(Arc::new(conn));
            return;
        }
        match state.peers.get_mut(&peer) {
            Some(PeerSlot::Connected(_)) | Some(PeerSlot::Closing(_)) => {
                drop(state);
                debug!(%peer, "already connected, dropping duplicate");
                self.spawn_close(Arc::new(conn));
                return;
            }
            Some(PeerSlot::Dialing(other)) => {
                // An anonymous dial reached a peer that is also being dialed
                // by id. This connection wins; the other dial is superseded.
                other.cancel();
            }
            None => {}
        }
        self.register(&mut state, Arc::new(conn));
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Upgrade an accepted stream and register the result.
    pub async fn accept(self: &Arc<Self>, inbound: Inbound) {
        let remote_addr = inbound.remote_addr.clone();
        match self.upgrader.accept(inbound).await {
            Ok(conn) => {
                self.on_inbound_connection(conn);
            }
            Err(e) => debug!(addr = %remote_addr, error = %e, "inbound upgrade failed"),
        }
    }

    /// Register a connection opened by a remote peer, pruning the least
    /// recently active peer when the limit is reached.
    pub fn on_inbound_connection(self: &Arc<Self>, conn: Connection) -> InboundOutcome {
        let peer = conn.remote_peer();
        let mut state = self.lock();

        match state.peers.get_mut(&peer) {
            Some(PeerSlot::Connected(_)) | Some(PeerSlot::Closing(_)) => {
                drop(state);
                debug!(%peer, "duplicate inbound connection rejected");
                self.spawn_close(Arc::new(conn));
                return InboundOutcome::Duplicate;
            }
            Some(PeerSlot::Dialing(dial)) => {
                // Our own dial to this peer is superseded and its slot reused.
                dial.cancel();
                self.register(&mut state, Arc::new(conn));
                return InboundOutcome::Accepted;
            }
            None => {}
        }

        let mut outcome = InboundOutcome::Accepted;
        if state.slots() >= self.max_connections {
            let victim = state
                .connected()
                .min_by_key(|c| c.last_activity())
                .map(|c| c.remote_peer());
            let Some(victim) = victim else {
                drop(state);
                debug!(%peer, "inbound connection rejected, at capacity");
                self.spawn_close(Arc::new(conn));
                return InboundOutcome::AtCapacity;
            };
            if let Some(PeerSlot::Connected(old)) = state.peers.remove(&victim) {
                info!(peer = %victim, "pruning least recently active peer");
                self.emit(NodeEvent::PeerDisconnect { peer: victim, reason: DisconnectReason::Pruned });
                self.spawn_close(old);
            }
            outcome = InboundOutcome::AcceptedAfterPrune(victim);
        }
        self.register(&mut state, Arc::new(conn));
        outcome
    }

    /// Move `conn` into Connected, announce it and start its stream pump.
    /// Called with the state lock held and the peer's slot free or Dialing.
    fn register(self: &Arc<Self>, state: &mut ManagerState, conn: Arc<Connection>) {
        let peer = conn.remote_peer();
        info!(%peer, addr = %conn.remote_addr(), direction = %conn.direction(), "peer connected");
        self.emit(NodeEvent::PeerConnect {
            peer,
            addr: conn.remote_addr().clone(),
            direction: conn.direction(),
        });
        state.peers.insert(peer, PeerSlot::Connected(conn.clone()));
        tokio::spawn(drive_connection(Arc::downgrade(self), conn, self.inbound_streams.clone()));
    }

    /// The session of `conn` ended on its own.
    fn on_session_ended(&self, conn: &Arc<Connection>) {
        let peer = conn.remote_peer();
        {
            let mut state = self.lock();
            match state.peers.get(&peer) {
                Some(PeerSlot::Connected(current)) if Arc::ptr_eq(current, conn) => {
                    state.peers.remove(&peer);
                    info!(%peer, "peer disconnected");
                    self.emit(NodeEvent::PeerDisconnect { peer, reason: DisconnectReason::RemoteClose });
                }
                // Closing, pruned or replaced: whoever changed the slot reports it.
                _ => return,
            }
        }
        self.check_min_connections();
    }

    // ── Closing ──────────────────────────────────────────────────────────────

    /// Close the connection to `peer`, or cancel a dial to it.
    ///
    /// Exactly one `peer:disconnect` is emitted for a connected peer, even
    /// when the session refuses to close in time. A cancelled dial reports
    /// one `peer:dial-failure`. Returns `false` if the peer was not tracked.
    pub async fn close(self: &Arc<Self>, peer: PeerId) -> bool {
        let conn = {
            let mut state = self.lock();
            match state.peers.remove(&peer) {
                Some(PeerSlot::Connected(conn)) => {
                    state.peers.insert(peer, PeerSlot::Closing(conn.clone()));
                    conn
                }
                Some(PeerSlot::Dialing(mut dial)) => {
                    // The slot is gone, so the dial task's guard stays quiet.
                    dial.cancel();
                    info!(%peer, "dial cancelled");
                    self.emit(NodeEvent::PeerDialFailure {
                        peer: Some(peer),
                        addr: None,
                        error: DIAL_CANCELLED.to_string(),
                    });
                    return true;
                }
                Some(closing @ PeerSlot::Closing(_)) => {
                    state.peers.insert(peer, closing);
                    return true;
                }
                None => return false,
            }
        };

        // Runs to completion even if the caller stops waiting.
        let manager = self.clone();
        let task = tokio::spawn(async move {
            manager.shutdown_session(&conn).await;
            manager.finish_close(&conn);
        });
        let _ = task.await;
        true
    }

    fn finish_close(&self, conn: &Arc<Connection>) {
        let peer = conn.remote_peer();
        {
            let mut state = self.lock();
            match state.peers.get(&peer) {
                Some(PeerSlot::Closing(current)) if Arc::ptr_eq(current, conn) => {
                    state.peers.remove(&peer);
                    info!(%peer, "peer disconnected");
                    self.emit(NodeEvent::PeerDisconnect { peer, reason: DisconnectReason::LocalClose });
                }
                _ => return,
            }
        }
        self.check_min_connections();
    }

    /// Close every connection and cancel every dial in flight.
    pub async fn close_all(self: &Arc<Self>) {
        let closing: Vec<Arc<Connection>> = {
            let mut state = self.lock();
            for (_, mut dial) in state.anonymous.drain() {
                dial.cancel();
            }
            let mut closing = Vec::new();
            state.peers.retain(|_, slot| match slot {
                PeerSlot::Dialing(dial) => {
                    dial.cancel();
                    false
                }
                PeerSlot::Connected(conn) => {
                    closing.push(conn.clone());
                    true
                }
                PeerSlot::Closing(_) => true,
            });
            for conn in &closing {
                state.peers.insert(conn.remote_peer(), PeerSlot::Closing(conn.clone()));
            }
            closing
        };

        let tasks: Vec<_> = closing
            .into_iter()
            .map(|conn| {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.shutdown_session(&conn).await;
                    manager.finish_close(&conn);
                })
            })
            .collect();
        futures::future::join_all(tasks).await;
    }

    /// Close the session, bounded by the close timeout. Failures are logged
    /// only; bookkeeping proceeds regardless.
    async fn shutdown_session(&self, conn: &Connection) {
        let peer = conn.remote_peer();
        match tokio::time::timeout(self.close_timeout, conn.session().close()).await {
            Ok(Ok(())) => trace!(%peer, "session closed"),
            Ok(Err(e)) => warn!(%peer, error = %e, "session close failed"),
            Err(_) => warn!(%peer, timeout = ?self.close_timeout, "session close timed out"),
        }
    }

    fn spawn_close(&self, conn: Arc<Connection>) {
        let timeout = self.close_timeout;
        tokio::spawn(async move {
            let peer = conn.remote_peer();
            match tokio::time::timeout(timeout, conn.session().close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(%peer, error = %e, "session close failed"),
                Err(_) => debug!(%peer, "session close timed out"),
            }
        });
    }

    fn check_min_connections(&self) {
        if self.below_min_connections() {
            info!(
                connected = self.connection_count(),
                min = self.min_connections,
                "below minimum connections"
            );
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Peers in the Connected state.
    pub fn connection_count(&self) -> usize {
        self.lock().connected().count()
    }

    /// Slots in use: connected, closing and dialing peers.
    pub fn slots_in_use(&self) -> usize {
        self.lock().slots()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Policy hook: true while fewer than `min_connections` peers are
    /// connected. Nothing dials because of it on its own.
    pub fn below_min_connections(&self) -> bool {
        self.connection_count() < self.min_connections
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        matches!(self.lock().peers.get(peer), Some(PeerSlot::Connected(_)))
    }

    pub fn is_dialing(&self, peer: &PeerId) -> bool {
        matches!(self.lock().peers.get(peer), Some(PeerSlot::Dialing(_)))
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.lock().connected().map(|c| c.remote_peer()).collect()
    }

    /// Whether some live connection was made to one of `addrs`.
    pub fn is_connected_to_any(&self, addrs: &[Multiaddr]) -> bool {
        self.lock().connected().any(|c| addrs.contains(c.remote_addr()))
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        match self.lock().peers.get(peer) {
            Some(PeerSlot::Connected(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    pub async fn open_stream(&self, peer: PeerId) -> Result<MuxStream, NodeError> {
        let conn = self.connection(&peer).ok_or(NodeError::NotConnected(peer))?;
        Ok(conn.open_stream().await?)
    }

    pub async fn ping(&self, peer: PeerId) -> Result<Duration, NodeError> {
        let conn = self.connection(&peer).ok_or(NodeError::NotConnected(peer))?;
        Ok(conn.ping().await?)
    }
}

/// Hand remote-opened streams to the node until the session ends, then
/// report the end to the manager.
async fn drive_connection(
    manager: Weak<ConnectionManager>,
    conn: Arc<Connection>,
    sink: mpsc::Sender<(PeerId, MuxStream)>,
) {
    let peer = conn.remote_peer();
    while let Some(stream) = conn.session().next_inbound().await {
        // A full or unclaimed sink drops the stream, which resets it.
        if sink.try_send((peer, stream)).is_err() {
            debug!(%peer, "inbound stream dropped, nobody is accepting");
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.on_session_ended(&conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxError, MuxedSession};
    use crate::transport::{MemoryHub, MemoryTransport, Transport, TransportRegistry};
    use async_trait::async_trait;
    use civnet_core::MultiaddrExt;
    use civnet_crypto::PeerIdentity;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    /// A session that never carries streams and can be told to fail closing.
    struct FakeSession {
        closed: AtomicBool,
        fail_close: bool,
        activity: Instant,
        ended: tokio::sync::watch::Sender<bool>,
    }

    impl FakeSession {
        fn build(fail_close: bool, activity: Instant) -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                fail_close,
                activity,
                ended: tokio::sync::watch::channel(false).0,
            })
        }

        fn new(fail_close: bool) -> Arc<Self> {
            Self::build(fail_close, Instant::now())
        }

        fn at(activity: Instant) -> Arc<Self> {
            Self::build(false, activity)
        }
    }

    #[async_trait]
    impl MuxedSession for FakeSession {
        async fn open_stream(&self) -> Result<MuxStream, MuxError> {
            Err(MuxError::Closed)
        }

        async fn next_inbound(&self) -> Option<MuxStream> {
            let mut ended = self.ended.subscribe();
            let _ = ended.wait_for(|ended| *ended).await;
            None
        }

        async fn ping(&self) -> Result<Duration, MuxError> {
            Err(MuxError::Closed)
        }

        async fn close(&self) -> Result<(), MuxError> {
            if self.fail_close {
                return Err(MuxError::Closed);
            }
            self.closed.store(true, Ordering::SeqCst);
            self.ended.send_replace(true);
            Ok(())
        }

        fn last_activity(&self) -> Instant {
            self.activity
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn manager(max: usize) -> (Arc<ConnectionManager>, broadcast::Receiver<NodeEvent>) {
        manager_with(TransportRegistry::new(), max)
    }

    fn manager_with(
        transports: TransportRegistry,
        max: usize,
    ) -> (Arc<ConnectionManager>, broadcast::Receiver<NodeEvent>) {
        let config = NodeConfig { max_connections: max, close_timeout_ms: 200, ..NodeConfig::default() };
        let upgrader = Upgrader::new(Arc::new(PeerIdentity::generate()), transports, &config);
        let (events, rx) = broadcast::channel(64);
        let (streams, _) = mpsc::channel(8);
        (ConnectionManager::new(upgrader, &config, events, streams), rx)
    }

    fn fake_conn(peer: PeerId, session: Arc<FakeSession>) -> Connection {
        Connection::new(peer, None, Multiaddr::memory(1), Direction::Inbound, session)
    }

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn inbound_over_capacity_prunes_least_recently_active() {
        let (manager, mut events) = manager(2);
        let now = Instant::now();
        let stale = FakeSession::at(now - Duration::from_secs(60));
        let fresh = FakeSession::at(now);

        assert_eq!(manager.on_inbound_connection(fake_conn(peer(1), stale.clone())), InboundOutcome::Accepted);
        assert_eq!(manager.on_inbound_connection(fake_conn(peer(2), fresh)), InboundOutcome::Accepted);
        assert_eq!(
            manager.on_inbound_connection(fake_conn(peer(3), FakeSession::new(false))),
            InboundOutcome::AcceptedAfterPrune(peer(1))
        );
        assert_eq!(manager.connection_count(), 2);
        assert!(!manager.is_connected(&peer(1)));

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        let pruned = kinds
            .iter()
            .filter(|e| matches!(e, NodeEvent::PeerDisconnect { peer: p, reason: DisconnectReason::Pruned } if *p == peer(1)))
            .count();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn duplicate_inbound_is_rejected() {
        let (manager, _events) = manager(4);
        let first = FakeSession::new(false);
        manager.on_inbound_connection(fake_conn(peer(1), first.clone()));
        let second = FakeSession::new(false);
        assert_eq!(manager.on_inbound_connection(fake_conn(peer(1), second.clone())), InboundOutcome::Duplicate);
        assert_eq!(manager.connection_count(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.is_closed());
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn close_emits_one_disconnect_even_when_session_close_fails() {
        let (manager, mut events) = manager(4);
        manager.on_inbound_connection(fake_conn(peer(9), FakeSession::new(true)));
        let _connect = events.recv().await.unwrap();

        assert!(manager.close(peer(9)).await);
        assert!(!manager.is_connected(&peer(9)));
        assert_eq!(manager.slots_in_use(), 0);

        match events.recv().await.unwrap() {
            NodeEvent::PeerDisconnect { peer: p, reason } => {
                assert_eq!(p, peer(9));
                assert_eq!(reason, DisconnectReason::LocalClose);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!manager.close(peer(9)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_close_is_reported_once() {
        let (manager, mut events) = manager(4);
        let session = FakeSession::new(false);
        manager.on_inbound_connection(fake_conn(peer(4), session.clone()));
        let _connect = events.recv().await.unwrap();

        // Ending the session from underneath the manager.
        session.close().await.unwrap();
        match events.recv().await.unwrap() {
            NodeEvent::PeerDisconnect { reason, .. } => assert_eq!(reason, DisconnectReason::RemoteClose),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn dial_requests_respect_policy() {
        let (manager, _events) = manager(1);
        let me = manager.local_peer();
        let record = |p: PeerId| PeerRecord::from_addr(Multiaddr::memory(5).with_peer_id(p), civnet_core::DiscoverySource::Manual);

        assert!(matches!(manager.request_dial(record(me)), DialRequest::SelfDial));
        assert!(matches!(
            manager.request_dial(PeerRecord::new(Some(peer(1)), civnet_core::DiscoverySource::Manual)),
            DialRequest::NoAddress
        ));

        manager.on_inbound_connection(fake_conn(peer(1), FakeSession::new(false)));
        assert!(matches!(manager.request_dial(record(peer(1))), DialRequest::AlreadyConnected));
        assert!(matches!(manager.request_dial(record(peer(2))), DialRequest::AtCapacity));
        assert!(!manager.below_min_connections());
    }

    #[tokio::test]
    async fn failed_dial_frees_the_slot_and_reports() {
        let (manager, mut events) = manager(1);
        let record = PeerRecord::from_addr(
            Multiaddr::memory(77).with_peer_id(peer(5)),
            civnet_core::DiscoverySource::Manual,
        );
        let DialRequest::Started(handle) = manager.request_dial(record.clone()) else {
            panic!("dial should start");
        };
        assert!(matches!(manager.request_dial(record), DialRequest::DialInProgress));
        handle.await.unwrap();

        match events.recv().await.unwrap() {
            NodeEvent::PeerDialFailure { peer: p, addr, .. } => {
                assert_eq!(p, Some(peer(5)));
                assert_eq!(addr, Some(Multiaddr::memory(77)));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.slots_in_use(), 0);
    }

    #[tokio::test]
    async fn hang_up_during_dial_reports_one_dial_failure() {
        let transport = MemoryTransport::new(MemoryHub::new());
        // Accepts the raw stream but never answers the handshake.
        let silent = transport.listen(&Multiaddr::memory(0)).await.unwrap();
        let (manager, mut events) = manager_with(TransportRegistry::new().with(transport), 2);

        let record = PeerRecord::from_addr(
            silent.local_addr.with_peer_id(peer(6)),
            civnet_core::DiscoverySource::Manual,
        );
        let DialRequest::Started(handle) = manager.request_dial(record) else {
            panic!("dial should start");
        };
        assert!(manager.is_dialing(&peer(6)));

        assert!(manager.close(peer(6)).await);
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(manager.slots_in_use(), 0);

        match events.recv().await.unwrap() {
            NodeEvent::PeerDialFailure { peer: p, addr, error } => {
                assert_eq!(p, Some(peer(6)));
                assert_eq!(addr, None);
                assert_eq!(error, DIAL_CANCELLED);
            }
            other => panic!("unexpected event {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }
}
