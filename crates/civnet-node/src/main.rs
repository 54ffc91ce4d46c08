//! civnet-node: runs a single civnet peer.
//!
//! Startup sequence:
//!   1. Load the JSON config (if any) and apply command-line overrides
//!   2. Generate a fresh identity
//!   3. Start listeners and bootstrap discovery
//!   4. Log node events and echo inbound streams until Ctrl-C

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use civnet_core::MultiaddrExt;
use civnet_crypto::PeerIdentity;
use civnet_p2p::{Node, NodeConfig, NodeEvent, TcpTransport, TransportRegistry};

#[derive(Parser, Debug)]
#[command(name = "civnet-node", version, about = "civnet peer-to-peer node")]
struct Args {
    /// JSON config file (camelCase keys, all optional).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen multiaddresses (comma-separated).
    #[arg(long, value_delimiter = ',')]
    listen: Vec<String>,

    /// Bootstrap peer multiaddresses (comma-separated).
    #[arg(long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    #[arg(long)]
    min_connections: Option<usize>,

    #[arg(long)]
    max_connections: Option<usize>,

    /// Only dial peers on request.
    #[arg(long)]
    no_auto_dial: bool,

    #[arg(long)]
    handshake_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,civnet=debug")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let identity = PeerIdentity::generate();
    info!(peer_id = %identity.peer_id(), "generated ephemeral identity");

    let transports = TransportRegistry::new().with(TcpTransport::new());
    let node = Node::new(identity, config, transports).context("configuring node")?;
    let mut events = node.subscribe();
    let mut inbound = node
        .take_inbound_streams()
        .context("inbound streams already taken")?;

    node.start().await.context("starting node")?;
    for addr in node.listen_addrs() {
        info!("Listening on {}", addr.with_peer_id(node.local_peer_id()));
    }

    // ── Echo service ──────────────────────────────────────────────────────────
    tokio::spawn(async move {
        while let Some((peer, mut stream)) = inbound.recv().await {
            tokio::spawn(async move {
                let result = async {
                    let payload = stream.read_to_end().await?;
                    stream.write(&payload).await?;
                    stream.close().await
                }
                .await;
                if let Err(e) = result {
                    debug!(%peer, error = %e, "echo stream failed");
                }
            });
        }
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event log lagged"),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("shutting down");
                break;
            }
        }
    }

    node.stop().await;
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerDiscovery(record) => {
            info!(addrs = ?record.addrs, source = %record.source, "Discovered {}", record.display_id())
        }
        NodeEvent::PeerConnect { peer, addr, direction } => {
            info!(%addr, %direction, "Connected to {peer}")
        }
        NodeEvent::PeerDisconnect { peer, reason } => {
            info!(%reason, "Disconnected from {peer}")
        }
        NodeEvent::PeerDialFailure { peer, addr, error } => warn!(
            peer = ?peer.map(|p| p.to_string()),
            addr = ?addr.as_ref().map(|a| a.to_string()),
            %error,
            "dial failed"
        ),
    }
}

/// Config file first, then command-line flags on top.
fn build_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };
    if !args.listen.is_empty() {
        config.listen_addrs = args.listen.clone();
    }
    if !args.bootstrap.is_empty() {
        config.bootstrap_list = args.bootstrap.clone();
    }
    if let Some(min) = args.min_connections {
        config.min_connections = min;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if args.no_auto_dial {
        config.auto_dial = false;
    }
    if let Some(ms) = args.handshake_timeout_ms {
        config.handshake_timeout_ms = ms;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_config(path: &Path) -> anyhow::Result<NodeConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing config {}", path.display()))
}
