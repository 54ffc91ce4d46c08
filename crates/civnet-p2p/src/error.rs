use civnet_core::types::PeerId;
use civnet_core::MultiaddrError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::identify::IdentifyError;
use crate::mux::MuxError;
use crate::secure::SecurityError;
use crate::transport::TransportError;

/// Failure anywhere in the transport → security → mux chain.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Identify(#[from] IdentifyError),

    #[error("remote peer is this node")]
    SelfConnection,
}

#[derive(Debug, Error)]
pub enum NodeError {
    // ── Lifecycle ──
    #[error("node is already started")]
    AlreadyStarted,

    #[error("no transports registered")]
    NoTransports,

    #[error("no listen address could be bound: {0}")]
    Listen(#[source] TransportError),

    // ── Configuration ──
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid listen address {addr:?}: {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: MultiaddrError,
    },

    // ── Per-peer operations ──
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    #[error(transparent)]
    Mux(#[from] MuxError),
}
