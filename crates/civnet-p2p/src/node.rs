use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use civnet_core::types::PeerId;
use civnet_core::{parse_multiaddr, DiscoverySource, Multiaddr, PeerRecord};
use civnet_crypto::PeerIdentity;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::discovery::{BootstrapDiscovery, Discovery};
use crate::error::NodeError;
use crate::event::NodeEvent;
use crate::manager::{ConnectionManager, DialRequest};
use crate::mux::MuxStream;
use crate::store::PeerStore;
use crate::transport::{Listener, TransportRegistry};
use crate::upgrade::Upgrader;

/// Backlog of remote-opened streams waiting for `take_inbound_streams`.
const INBOUND_STREAM_BACKLOG: usize = 256;

/// Records in flight between discovery strategies and the node.
const DISCOVERY_BACKLOG: usize = 64;

struct Running {
    tasks: Vec<JoinHandle<()>>,
}

/// A peer-to-peer node: listeners, discovery and the connection manager
/// under one start/stop lifecycle.
///
/// All state belongs to the instance, so any number of nodes can share a
/// process (and, through a `MemoryHub`, talk to each other).
pub struct Node {
    identity: Arc<PeerIdentity>,
    config: NodeConfig,
    listen_on: Vec<Multiaddr>,
    manager: Arc<ConnectionManager>,
    store: Arc<Mutex<PeerStore>>,
    events: broadcast::Sender<NodeEvent>,
    discoveries: tokio::sync::Mutex<Vec<Box<dyn Discovery>>>,
    inbound_streams: Mutex<Option<mpsc::Receiver<(PeerId, MuxStream)>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Node {
    /// Build a stopped node. Bootstrap discovery is installed from
    /// `config.bootstrap_list`.
    pub fn new(
        identity: PeerIdentity,
        config: NodeConfig,
        transports: TransportRegistry,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let listen_on = config
            .listen_addrs
            .iter()
            .map(|addr| {
                parse_multiaddr(addr)
                    .map_err(|source| NodeError::InvalidListenAddr { addr: addr.clone(), source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let identity = Arc::new(identity);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (streams_tx, streams_rx) = mpsc::channel(INBOUND_STREAM_BACKLOG);
        let upgrader = Upgrader::new(identity.clone(), transports, &config);
        let manager = ConnectionManager::new(upgrader, &config, events.clone(), streams_tx);
        let bootstrap: Box<dyn Discovery> = Box::new(BootstrapDiscovery::new(config.bootstrap_list.clone()));

        Ok(Self {
            identity,
            config,
            listen_on,
            manager,
            store: Arc::new(Mutex::new(PeerStore::new())),
            events,
            discoveries: tokio::sync::Mutex::new(vec![bootstrap]),
            inbound_streams: Mutex::new(Some(streams_rx)),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Add a discovery strategy next to the bootstrap list.
    pub fn with_discovery<D: Discovery>(mut self, discovery: D) -> Self {
        self.discoveries.get_mut().push(Box::new(discovery));
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Observe node events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Streams opened by remote peers. Only the first call gets the
    /// receiver; until then, and after it is dropped, such streams are reset.
    pub fn take_inbound_streams(&self) -> Option<mpsc::Receiver<(PeerId, MuxStream)>> {
        lock(&self.inbound_streams).take()
    }

    /// Addresses actually bound by the listeners, empty while stopped.
    /// These are what identify announces to peers.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.manager.upgrader().listen_addrs()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bind listeners, then start discovery.
    ///
    /// Fails when no transport is registered or when listen addresses are
    /// configured but none of them could be bound. A partial bind failure is
    /// only logged.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(NodeError::AlreadyStarted);
        }
        let transports = self.manager.upgrader().transports();
        if transports.is_empty() {
            return Err(NodeError::NoTransports);
        }

        let mut listeners = Vec::new();
        let mut last_error = None;
        for addr in &self.listen_on {
            match transports.listen(addr).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    warn!(%addr, error = %e, "failed to listen");
                    last_error = Some(e);
                }
            }
        }
        if listeners.is_empty() {
            if let Some(e) = last_error {
                return Err(NodeError::Listen(e));
            }
        }
        self.manager
            .upgrader()
            .set_listen_addrs(listeners.iter().map(|l| l.local_addr.clone()).collect());

        // Subscribed before any listener runs, so no connect is missed.
        let identified = self.events.subscribe();
        let mut tasks: Vec<JoinHandle<()>> = listeners
            .into_iter()
            .map(|listener| tokio::spawn(accept_loop(listener, self.manager.clone())))
            .collect();
        tasks.push(tokio::spawn(identify_loop(identified, self.manager.clone(), self.store.clone())));

        if self.config.auto_dial {
            // Subscribe before anything can connect, so no disconnect is missed.
            let events = self.events.subscribe();
            tasks.push(tokio::spawn(backfill_loop(
                events,
                self.manager.clone(),
                self.store.clone(),
                self.config.redial_backoff(),
            )));
        }

        let (sink, records) = mpsc::channel(DISCOVERY_BACKLOG);
        tasks.push(tokio::spawn(discovery_loop(
            records,
            self.manager.clone(),
            self.store.clone(),
            self.events.clone(),
            self.config.auto_dial,
        )));
        for discovery in self.discoveries.lock().await.iter_mut() {
            debug!(strategy = discovery.name(), "starting discovery");
            discovery.start(sink.clone()).await;
        }

        *running = Some(Running { tasks });
        info!(peer = %self.local_peer_id(), addrs = ?self.listen_addrs(), "node started");
        Ok(())
    }

    /// Stop listeners and discovery, close every connection and forget all
    /// discovered peers. Does nothing on a stopped node.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        for task in running.tasks {
            task.abort();
        }
        for discovery in self.discoveries.lock().await.iter_mut() {
            discovery.stop().await;
        }
        self.manager.close_all().await;
        lock(&self.store).clear();
        self.manager.upgrader().set_listen_addrs(Vec::new());
        info!(peer = %self.local_peer_id(), "node stopped");
    }

    // ── Peers ────────────────────────────────────────────────────────────────

    /// Remember `record` and dial it, subject to the connection limits.
    pub fn dial(&self, record: PeerRecord) -> DialRequest {
        let (_, merged) = lock(&self.store).upsert(record);
        self.manager.request_dial(merged)
    }

    /// Dial a single address, e.g. `/ip4/1.2.3.4/tcp/7777/p2p/<id>`.
    pub fn dial_addr(&self, addr: Multiaddr) -> DialRequest {
        self.dial(PeerRecord::from_addr(addr, DiscoverySource::Manual))
    }

    /// Close the connection to `peer`. Returns `false` if not connected.
    pub async fn hang_up(&self, peer: PeerId) -> bool {
        self.manager.close(peer).await
    }

    /// Drop `peer` from the address book so it is not redialed.
    pub fn forget(&self, peer: &PeerId) -> bool {
        lock(&self.store).forget(peer)
    }

    pub fn known_peers(&self) -> Vec<PeerRecord> {
        lock(&self.store).candidates()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.manager.connected_peers()
    }

    pub fn connection_count(&self) -> usize {
        self.manager.connection_count()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.manager.is_connected(peer)
    }

    pub async fn open_stream(&self, peer: PeerId) -> Result<MuxStream, NodeError> {
        self.manager.open_stream(peer).await
    }

    pub async fn ping(&self, peer: PeerId) -> Result<Duration, NodeError> {
        self.manager.ping(peer).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            for task in running.tasks {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("peer", &self.identity.peer_id()).finish()
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Accept and upgrade inbound streams. Upgrades in flight are owned by the
/// loop and die with it.
async fn accept_loop(mut listener: Listener, manager: Arc<ConnectionManager>) {
    let mut upgrades = JoinSet::new();
    loop {
        tokio::select! {
            next = listener.incoming.next() => match next {
                Some(Ok(inbound)) => {
                    trace!(addr = %inbound.remote_addr, "inbound connection");
                    let manager = manager.clone();
                    upgrades.spawn(async move { manager.accept(inbound).await });
                }
                Some(Err(e)) => warn!(addr = %listener.local_addr, error = %e, "accept failed"),
                None => break,
            },
            Some(_) = upgrades.join_next(), if !upgrades.is_empty() => {}
        }
    }
    debug!(addr = %listener.local_addr, "listener closed");
}

/// Record discoveries, announce fresh ones and dial when auto-dial is on.
async fn discovery_loop(
    mut records: mpsc::Receiver<PeerRecord>,
    manager: Arc<ConnectionManager>,
    store: Arc<Mutex<PeerStore>>,
    events: broadcast::Sender<NodeEvent>,
    auto_dial: bool,
) {
    while let Some(record) = records.recv().await {
        let (outcome, merged) = lock(&store).upsert(record);
        if outcome.is_fresh() {
            debug!(peer = %merged.display_id(), source = %merged.source, "peer discovered");
            let _ = events.send(NodeEvent::PeerDiscovery(merged.clone()));
        }
        if auto_dial {
            let request = manager.request_dial(merged);
            trace!(?request, "auto-dial");
        }
    }
}

/// File the listen addresses each newly connected peer announced.
///
/// These upserts are address-book maintenance, not discoveries: no
/// `peer:discovery` is emitted for them.
async fn identify_loop(
    mut events: broadcast::Receiver<NodeEvent>,
    manager: Arc<ConnectionManager>,
    store: Arc<Mutex<PeerStore>>,
) {
    loop {
        let peer = match events.recv().await {
            Ok(NodeEvent::PeerConnect { peer, .. }) => peer,
            Ok(_) => continue,
            Err(RecvError::Lagged(missed)) => {
                debug!(missed, "identify lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(conn) = manager.connection(&peer) else {
            continue;
        };
        let Some(info) = conn.identify() else {
            continue;
        };
        let mut record = PeerRecord::new(Some(peer), DiscoverySource::Identify);
        for addr in info.dialable_addrs(conn.remote_addr()) {
            record.add_addr(addr);
        }
        if record.addrs.is_empty() {
            continue;
        }
        let (outcome, merged) = lock(&store).upsert(record);
        trace!(%peer, ?outcome, addrs = merged.addrs.len(), "identify addresses filed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DialTarget {
    Peer(PeerId),
    Address(Multiaddr),
}

/// Dial targets that failed recently. Backfill skips them until their
/// backoff runs out, so unreachable candidates cannot trigger each other.
struct RecentFailures {
    backoff: Duration,
    until: HashMap<DialTarget, Instant>,
}

impl RecentFailures {
    fn new(backoff: Duration) -> Self {
        Self { backoff, until: HashMap::new() }
    }

    fn record(&mut self, peer: Option<PeerId>, addr: Option<&Multiaddr>) {
        let target = match (peer, addr) {
            (Some(peer), _) => DialTarget::Peer(peer),
            (None, Some(addr)) => DialTarget::Address(addr.clone()),
            (None, None) => return,
        };
        self.until.insert(target, Instant::now() + self.backoff);
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.until.retain(|_, until| *until > now);
    }

    fn blocks(&self, record: &PeerRecord) -> bool {
        match record.peer_id {
            Some(peer) => self.until.contains_key(&DialTarget::Peer(peer)),
            None => record
                .addrs
                .iter()
                .any(|addr| self.until.contains_key(&DialTarget::Address(addr.clone()))),
        }
    }
}

/// When a slot frees, because a peer left or a dial failed, try known peers
/// that are not connected yet.
async fn backfill_loop(
    mut events: broadcast::Receiver<NodeEvent>,
    manager: Arc<ConnectionManager>,
    store: Arc<Mutex<PeerStore>>,
    backoff: Duration,
) {
    let mut failures = RecentFailures::new(backoff);
    loop {
        let gone = match events.recv().await {
            Ok(NodeEvent::PeerDisconnect { peer, .. }) => Some(peer),
            Ok(NodeEvent::PeerDialFailure { peer, addr, .. }) => {
                failures.record(peer, addr.as_ref());
                None
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(missed)) => {
                debug!(missed, "backfill lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        failures.prune();
        if manager.below_min_connections() {
            debug!("below minimum connections, backfilling from known peers");
        }
        let candidates = lock(&store).candidates();
        for record in candidates {
            if gone.is_some() && record.peer_id == gone {
                continue;
            }
            if failures.blocks(&record) {
                trace!(peer = %record.display_id(), "backfill skips recently failed peer");
                continue;
            }
            if record.peer_id.is_none() && manager.is_connected_to_any(&record.addrs) {
                continue;
            }
            match manager.request_dial(record) {
                DialRequest::AtCapacity => break,
                DialRequest::Started(_) => debug!("backfill dial started"),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};
    use civnet_core::MultiaddrExt;

    fn memory_node(hub: &MemoryHub, config: NodeConfig) -> Node {
        let transports = TransportRegistry::new().with(MemoryTransport::new(hub.clone()));
        Node::new(PeerIdentity::generate(), config, transports).unwrap()
    }

    fn memory_config() -> NodeConfig {
        NodeConfig { listen_addrs: vec!["/memory/0".into()], ..NodeConfig::default() }
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_idempotent() {
        let node = memory_node(&MemoryHub::new(), memory_config());
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));
        assert_eq!(node.listen_addrs().len(), 1);

        node.stop().await;
        node.stop().await;
        assert!(!node.is_running().await);
        assert!(node.listen_addrs().is_empty());

        node.start().await.unwrap();
        node.stop().await;
    }

    #[tokio::test]
    async fn start_without_transports_fails() {
        let node = Node::new(PeerIdentity::generate(), memory_config(), TransportRegistry::new()).unwrap();
        assert!(matches!(node.start().await, Err(NodeError::NoTransports)));
    }

    #[tokio::test]
    async fn start_fails_when_nothing_binds() {
        let config = NodeConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/1".into()],
            ..NodeConfig::default()
        };
        let node = memory_node(&MemoryHub::new(), config);
        assert!(matches!(node.start().await, Err(NodeError::Listen(_))));
        assert!(!node.is_running().await);
    }

    #[test]
    fn recent_failures_block_by_peer_or_address_until_expiry() {
        let peer = PeerIdentity::generate().peer_id();
        let addr = Multiaddr::memory(31);
        let by_peer = PeerRecord::from_addr(addr.with_peer_id(peer), DiscoverySource::Bootstrap);
        let anonymous = PeerRecord::from_addr(addr.clone(), DiscoverySource::Bootstrap);

        let mut failures = RecentFailures::new(Duration::from_secs(60));
        assert!(!failures.blocks(&by_peer));
        failures.record(None, Some(&addr));
        assert!(failures.blocks(&anonymous));
        assert!(!failures.blocks(&by_peer));
        failures.record(Some(peer), Some(&addr));
        assert!(failures.blocks(&by_peer));

        let mut expired = RecentFailures::new(Duration::ZERO);
        expired.record(Some(peer), None);
        expired.prune();
        assert!(!expired.blocks(&by_peer));
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let hub = MemoryHub::new();
        let transports = || TransportRegistry::new().with(MemoryTransport::new(hub.clone()));

        let bad_limits = NodeConfig { min_connections: 5, max_connections: 1, ..memory_config() };
        assert!(matches!(
            Node::new(PeerIdentity::generate(), bad_limits, transports()),
            Err(NodeError::Config(_))
        ));

        let bad_addr = NodeConfig { listen_addrs: vec!["memory/0".into()], ..NodeConfig::default() };
        assert!(matches!(
            Node::new(PeerIdentity::generate(), bad_addr, transports()),
            Err(NodeError::InvalidListenAddr { .. })
        ));
    }
}
