//! Whole-node integration tests over the in-memory transport.
//!
//! Every test builds its own `MemoryHub`, so nodes from different tests never
//! see each other.
//!
//! Run with:
//!   cargo test -p civnet-p2p --test node

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use civnet_core::types::PeerId;
use civnet_core::{DiscoverySource, Multiaddr, MultiaddrExt, PeerRecord};
use civnet_crypto::PeerIdentity;
use civnet_p2p::{
    DialRequest, DisconnectReason, MemoryHub, MemoryTransport, Node, NodeConfig, NodeEvent,
    Transport, TransportRegistry,
};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(15);

// ── Helpers ───────────────────────────────────────────────────────────────────

fn config() -> NodeConfig {
    NodeConfig {
        listen_addrs: vec!["/memory/0".into()],
        auto_dial: false,
        ..NodeConfig::default()
    }
}

fn node(hub: &MemoryHub, config: NodeConfig) -> Node {
    let transports = TransportRegistry::new().with(MemoryTransport::new(hub.clone()));
    Node::new(PeerIdentity::generate(), config, transports).unwrap()
}

/// Start a node and return it with its dialable `/memory/<n>/p2p/<id>` address.
async fn started(hub: &MemoryHub, config: NodeConfig) -> (Node, Multiaddr) {
    let node = node(hub, config);
    node.start().await.unwrap();
    let addr = node.listen_addrs()[0].with_peer_id(node.local_peer_id());
    (node, addr)
}

async fn wait_for(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut pred: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_connect(events: &mut broadcast::Receiver<NodeEvent>, peer: PeerId) {
    wait_for(events, |e| matches!(e, NodeEvent::PeerConnect { peer: p, .. } if *p == peer)).await;
}

/// Everything already queued on `events`, after a short settle period.
async fn drain(events: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

// ── Discovery ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_with_malformed_entry_emits_two_discoveries() {
    let hub = MemoryHub::new();
    let config = NodeConfig {
        bootstrap_list: vec![
            format!("/memory/4100/p2p/{}", PeerIdentity::generate().peer_id()),
            "/memory/not-a-port".into(),
            "/memory/4101".into(),
        ],
        ..config()
    };
    let node = node(&hub, config);
    let mut events = node.subscribe();

    node.start().await.expect("malformed bootstrap entries are not fatal");

    let discoveries = drain(&mut events)
        .await
        .into_iter()
        .filter(|e| e.kind() == "peer:discovery")
        .count();
    assert_eq!(discoveries, 2);
    assert_eq!(node.known_peers().len(), 2);
    node.stop().await;
}

#[tokio::test]
async fn restart_announces_bootstrap_again() {
    let hub = MemoryHub::new();
    let config = NodeConfig { bootstrap_list: vec!["/memory/4200".into()], ..config() };
    let node = node(&hub, config);
    let mut events = node.subscribe();

    node.start().await.unwrap();
    wait_for(&mut events, |e| e.kind() == "peer:discovery").await;
    node.stop().await;
    assert!(node.known_peers().is_empty());

    node.start().await.unwrap();
    wait_for(&mut events, |e| e.kind() == "peer:discovery").await;
    node.stop().await;
}

// ── Connection policy ─────────────────────────────────────────────────────────

#[tokio::test]
async fn fills_to_max_then_backfills_when_a_slot_frees() {
    let hub = MemoryHub::new();
    let (a, a_addr) = started(&hub, config()).await;
    let (b, b_addr) = started(&hub, config()).await;
    let (c, c_addr) = started(&hub, config()).await;

    let config = NodeConfig {
        min_connections: 1,
        max_connections: 2,
        auto_dial: true,
        bootstrap_list: vec![a_addr.to_string(), b_addr.to_string(), c_addr.to_string()],
        ..config()
    };
    let node = node(&hub, config);
    let mut events = node.subscribe();
    node.start().await.unwrap();

    let mut connected = HashSet::new();
    while connected.len() < 2 {
        if let NodeEvent::PeerConnect { peer, .. } = wait_for(&mut events, |e| e.kind() == "peer:connect").await {
            connected.insert(peer);
        }
    }
    assert_eq!(connected, HashSet::from([a.local_peer_id(), b.local_peer_id()]));

    // C is left alone while both slots are taken.
    let settled = drain(&mut events).await;
    assert!(settled.iter().all(|e| e.peer() != Some(c.local_peer_id()) || e.kind() == "peer:discovery"));
    assert_eq!(c.connection_count(), 0);
    assert_eq!(node.connection_count(), 2);

    assert!(node.hang_up(a.local_peer_id()).await);
    wait_connect(&mut events, c.local_peer_id()).await;
    assert_eq!(
        node.connected_peers().into_iter().collect::<HashSet<_>>(),
        HashSet::from([b.local_peer_id(), c.local_peer_id()])
    );
    assert!(!node.is_connected(&a.local_peer_id()));

    node.stop().await;
    for peer in [a, b, c] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn failed_dial_frees_its_slot_for_the_next_candidate() {
    let hub = MemoryHub::new();
    let (b, b_addr) = started(&hub, config()).await;
    let (c, c_addr) = started(&hub, config()).await;
    let ghost = PeerIdentity::generate().peer_id();

    let config = NodeConfig {
        max_connections: 2,
        auto_dial: true,
        bootstrap_list: vec![
            Multiaddr::memory(4400).with_peer_id(ghost).to_string(),
            b_addr.to_string(),
            c_addr.to_string(),
        ],
        ..config()
    };
    let node = node(&hub, config);
    let mut events = node.subscribe();
    node.start().await.unwrap();

    let mut seen = Vec::new();
    let mut connected = HashSet::new();
    while connected.len() < 2 {
        let event = wait_for(&mut events, |_| true).await;
        if let NodeEvent::PeerConnect { peer, .. } = &event {
            connected.insert(*peer);
        }
        seen.push(event);
    }
    assert_eq!(connected, HashSet::from([b.local_peer_id(), c.local_peer_id()]));
    assert_eq!(node.connection_count(), 2);

    // The unreachable peer is tried once, not again on every freed slot.
    seen.extend(drain(&mut events).await);
    let ghost_failures = seen
        .iter()
        .filter(|e| e.kind() == "peer:dial-failure" && e.peer() == Some(ghost))
        .count();
    assert_eq!(ghost_failures, 1);
    assert!(!node.manager().is_dialing(&ghost));

    node.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dials_to_one_peer_make_one_connection() {
    let hub = MemoryHub::new();
    let (remote, remote_addr) = started(&hub, config()).await;
    let node = Arc::new(node(&hub, config()));
    let mut events = node.subscribe();
    node.start().await.unwrap();

    let record = PeerRecord::from_addr(remote_addr, DiscoverySource::Manual);
    let started_dials = Arc::new(AtomicUsize::new(0));
    let requests: Vec<_> = (0..16)
        .map(|_| {
            let manager = node.manager().clone();
            let record = record.clone();
            let started_dials = started_dials.clone();
            tokio::spawn(async move {
                if let DialRequest::Started(_) = manager.request_dial(record) {
                    started_dials.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    futures::future::join_all(requests).await;

    assert_eq!(started_dials.load(Ordering::SeqCst), 1);
    wait_connect(&mut events, remote.local_peer_id()).await;
    let connects = drain(&mut events).await.iter().filter(|e| e.kind() == "peer:connect").count();
    assert_eq!(connects, 0, "peer:connect must not repeat for a connected peer");
    assert_eq!(node.connection_count(), 1);
    assert_eq!(remote.connection_count(), 1);
    assert!(matches!(node.manager().request_dial(record), DialRequest::AlreadyConnected));

    node.stop().await;
    remote.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inbound_burst_never_exceeds_max() {
    const MAX: usize = 3;
    const CLIENTS: usize = 8;

    let hub = MemoryHub::new();
    let (server, server_addr) = started(&hub, NodeConfig { max_connections: MAX, ..config() }).await;
    let mut events = server.subscribe();

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(started(&hub, config()).await.0);
    }
    for client in &clients {
        assert!(client.dial_addr(server_addr.clone()).is_started());
    }

    let mut live: usize = 0;
    let mut connects = 0;
    while connects < CLIENTS {
        match wait_for(&mut events, |e| matches!(e.kind(), "peer:connect" | "peer:disconnect")).await {
            NodeEvent::PeerConnect { .. } => {
                live += 1;
                connects += 1;
            }
            NodeEvent::PeerDisconnect { reason, .. } => {
                assert_eq!(reason, DisconnectReason::Pruned);
                live -= 1;
            }
            _ => unreachable!(),
        }
        assert!(live <= MAX, "{live} connections with max {MAX}");
        assert!(server.manager().slots_in_use() <= MAX);
    }
    assert_eq!(server.connection_count(), MAX);

    server.stop().await;
    for client in clients {
        client.stop().await;
    }
}

// ── Dial outcomes ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_dial_releases_the_raw_stream() {
    let hub = MemoryHub::new();

    // A listener that accepts and then never answers the handshake.
    let silent = MemoryTransport::new(hub.clone());
    let mut listener = silent.listen(&"/memory/0".parse().unwrap()).await.unwrap();
    let silent_addr = listener.local_addr.with_peer_id(PeerIdentity::generate().peer_id());
    let held = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(Ok(inbound)) = listener.incoming.next().await {
            held.push(inbound);
        }
    });

    let transport = MemoryTransport::new(hub.clone());
    let stats = transport.dial_stats();
    let node = Node::new(PeerIdentity::generate(), config(), TransportRegistry::new().with(transport)).unwrap();
    let mut events = node.subscribe();
    node.start().await.unwrap();

    let DialRequest::Started(dial) = node.dial_addr(silent_addr) else {
        panic!("dial should start");
    };
    timeout(WAIT, async {
        while stats.opened() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dial never reached the transport");
    assert_eq!(stats.live(), 1);

    dial.abort();
    assert!(dial.await.unwrap_err().is_cancelled());
    assert_eq!(stats.opened(), stats.closed());
    assert_eq!(node.manager().slots_in_use(), 0);
    wait_for(&mut events, |e| e.kind() == "peer:dial-failure").await;

    node.stop().await;
    held.abort();
}

#[tokio::test]
async fn redial_after_cancel_keeps_its_reservation() {
    let hub = MemoryHub::new();
    let silent = MemoryTransport::new(hub.clone());
    let mut listener = silent.listen(&"/memory/0".parse().unwrap()).await.unwrap();
    let target = PeerIdentity::generate().peer_id();
    let target_addr = listener.local_addr.with_peer_id(target);
    let held = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(Ok(inbound)) = listener.incoming.next().await {
            held.push(inbound);
        }
    });

    let (node, _) = started(&hub, config()).await;
    assert!(node.dial_addr(target_addr.clone()).is_started());
    assert!(node.hang_up(target).await);
    assert!(node.dial_addr(target_addr).is_started());

    // The first dial's teardown must not free the second dial's slot.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.manager().is_dialing(&target));
    assert_eq!(node.manager().slots_in_use(), 1);

    node.stop().await;
    held.abort();
}

#[tokio::test]
async fn wrong_peer_id_is_a_dial_failure() {
    let hub = MemoryHub::new();
    let (remote, remote_addr) = started(&hub, config()).await;
    let impostor = PeerIdentity::generate().peer_id();
    let (node, _) = started(&hub, config()).await;
    let mut events = node.subscribe();

    assert!(node.dial_addr(remote_addr.with_peer_id(impostor)).is_started());
    match wait_for(&mut events, |e| e.kind() == "peer:dial-failure").await {
        NodeEvent::PeerDialFailure { peer, error, .. } => {
            assert_eq!(peer, Some(impostor));
            assert!(error.contains("mismatch"), "{error}");
        }
        _ => unreachable!(),
    }
    assert_eq!(node.connection_count(), 0);
    assert_eq!(remote.connection_count(), 0);

    node.stop().await;
    remote.stop().await;
}

#[tokio::test]
async fn unreachable_peer_reports_failure_and_node_keeps_running() {
    let hub = MemoryHub::new();
    let (node, _) = started(&hub, config()).await;
    let mut events = node.subscribe();
    let ghost = PeerIdentity::generate().peer_id();

    node.dial_addr(Multiaddr::memory(4300).with_peer_id(ghost));
    let failure = wait_for(&mut events, |e| e.kind() == "peer:dial-failure").await;
    assert_eq!(failure.peer(), Some(ghost));
    assert!(node.is_running().await);

    // The same peer may be tried again later.
    assert!(node.dial_addr(Multiaddr::memory(4300).with_peer_id(ghost)).is_started());
    node.stop().await;
}

#[tokio::test]
async fn anonymous_bootstrap_entry_learns_the_peer_id() {
    let hub = MemoryHub::new();
    let (remote, remote_addr) = started(&hub, config()).await;
    let config = NodeConfig {
        auto_dial: true,
        bootstrap_list: vec![remote_addr.without_peer_id().to_string()],
        ..config()
    };
    let node = node(&hub, config);
    let mut events = node.subscribe();
    node.start().await.unwrap();

    wait_connect(&mut events, remote.local_peer_id()).await;
    assert!(node.is_connected(&remote.local_peer_id()));

    node.stop().await;
    remote.stop().await;
}

// ── Connections ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn streams_and_ping_over_a_connection() {
    let hub = MemoryHub::new();
    let (server, server_addr) = started(&hub, config()).await;
    let mut incoming = server.take_inbound_streams().unwrap();
    assert!(server.take_inbound_streams().is_none());

    let (client, _) = started(&hub, config()).await;
    let mut events = client.subscribe();
    client.dial_addr(server_addr);
    wait_connect(&mut events, server.local_peer_id()).await;

    let mut stream = client.open_stream(server.local_peer_id()).await.unwrap();
    stream.write(b"hello").await.unwrap();
    stream.close().await.unwrap();

    let (from, mut remote) = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
    assert_eq!(from, client.local_peer_id());
    assert_eq!(remote.read_to_end().await.unwrap(), b"hello");
    remote.write(b"world").await.unwrap();
    remote.close().await.unwrap();
    assert_eq!(stream.read_to_end().await.unwrap(), b"world");

    let rtt = client.ping(server.local_peer_id()).await.unwrap();
    assert!(rtt < WAIT);

    let stranger = PeerIdentity::generate().peer_id();
    assert!(client.open_stream(stranger).await.is_err());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn identify_files_an_inbound_peers_listen_address() {
    let hub = MemoryHub::new();
    let (server, server_addr) = started(&hub, config()).await;
    let mut server_events = server.subscribe();
    let (client, _) = started(&hub, config()).await;
    let client_listen = client.listen_addrs();

    client.dial_addr(server_addr);
    wait_connect(&mut server_events, client.local_peer_id()).await;

    let conn = server.manager().connection(&client.local_peer_id()).unwrap();
    assert_eq!(conn.identify().unwrap().listen_addrs, client_listen);

    // Filed by a background task after the connect event.
    let record = timeout(WAIT, async {
        loop {
            let known = server.known_peers();
            if let Some(record) = known.into_iter().find(|r| r.peer_id == Some(client.local_peer_id())) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("identify never filed the client");
    assert_eq!(record.source, DiscoverySource::Identify);
    assert_eq!(record.addrs, client_listen);

    // Address-book upkeep only, not a discovery.
    assert!(drain(&mut server_events).await.iter().all(|e| e.kind() != "peer:discovery"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn hang_up_and_stop_report_exactly_one_disconnect() {
    let hub = MemoryHub::new();
    let (server, server_addr) = started(&hub, config()).await;
    let mut server_events = server.subscribe();
    let (client, _) = started(&hub, config()).await;
    let mut client_events = client.subscribe();

    client.dial_addr(server_addr.clone());
    wait_connect(&mut client_events, server.local_peer_id()).await;
    wait_connect(&mut server_events, client.local_peer_id()).await;

    assert!(client.hang_up(server.local_peer_id()).await);
    let local = drain(&mut client_events).await;
    let disconnects: Vec<_> = local.iter().filter(|e| e.kind() == "peer:disconnect").collect();
    assert_eq!(disconnects.len(), 1);
    assert!(matches!(
        disconnects[0],
        NodeEvent::PeerDisconnect { reason: DisconnectReason::LocalClose, .. }
    ));

    match wait_for(&mut server_events, |e| e.kind() == "peer:disconnect").await {
        NodeEvent::PeerDisconnect { peer, reason } => {
            assert_eq!(peer, client.local_peer_id());
            assert_eq!(reason, DisconnectReason::RemoteClose);
        }
        _ => unreachable!(),
    }
    assert_eq!(server.connection_count(), 0);
    assert!(!client.hang_up(server.local_peer_id()).await);

    // Reconnect, then stop the client: the server sees the peer go away.
    client.dial_addr(server_addr);
    wait_connect(&mut server_events, client.local_peer_id()).await;
    client.stop().await;
    wait_for(&mut server_events, |e| e.kind() == "peer:disconnect").await;
    assert_eq!(client.connection_count(), 0);

    server.stop().await;
}
