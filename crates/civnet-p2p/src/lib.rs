//! civnet-p2p
//!
//! Connection-establishment substrate for civnet nodes.
//!
//! Raw byte streams from a pluggable transport are upgraded into
//! authenticated, encrypted channels (Dilithium2 identities, Kyber768 key
//! exchange, ChaCha20-Poly1305 frames), which are in turn multiplexed into
//! independent streams. An identify exchange on every new channel tells each
//! side where the other listens. The connection manager owns the resulting
//! connections and enforces the connection limits; bootstrap discovery feeds
//! it candidates. `Node` ties everything to one start/stop lifecycle and
//! reports `peer:*` events.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod event;
pub mod identify;
pub mod manager;
pub mod mux;
pub mod node;
pub mod secure;
pub mod store;
pub mod transport;
pub mod upgrade;

pub use config::{ConfigError, MuxConfig, NodeConfig};
pub use connection::Connection;
pub use discovery::{BootstrapDiscovery, Discovery};
pub use error::{NodeError, UpgradeError};
pub use event::{DisconnectReason, NodeEvent};
pub use identify::{IdentifyError, IdentifyInfo};
pub use manager::{ConnectionManager, DialRequest, InboundOutcome};
pub use mux::{MuxError, MuxStream, MuxedSession, Multiplexer};
pub use node::Node;
pub use secure::{Negotiator, SecureChannel, SecurityError};
pub use store::{PeerStore, Upsert};
pub use transport::{
    MemoryHub, MemoryTransport, TcpTransport, Transport, TransportError, TransportRegistry,
};
pub use upgrade::Upgrader;
