//! Pluggable byte-stream transports.
//!
//! A transport turns a `Multiaddr` into a raw, unauthenticated byte stream
//! (`dial`) or a sequence of them (`listen`). The registry picks the
//! implementation from the address's leading protocol components.

pub mod memory;
pub mod tcp;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use civnet_core::Multiaddr;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{MemoryHub, MemoryTransport, StreamStats};
pub use tcp::TcpTransport;

/// Anything a transport can hand back as a connection.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawStream for T {}

pub type BoxedStream = Box<dyn RawStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: Multiaddr,
        #[source]
        source: io::Error,
    },

    #[error("dial {addr} timed out after {timeout:?}")]
    DialTimeout { addr: Multiaddr, timeout: Duration },

    #[error("listen on {addr} failed: {source}")]
    Listen {
        addr: Multiaddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("no transport supports {0}")]
    Unsupported(Multiaddr),
}

/// One accepted inbound stream.
pub struct Inbound {
    pub stream: BoxedStream,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
}

/// An active listener. `incoming` never ends on its own; dropping the
/// listener releases the bound address, after which `listen` may be called
/// again on it.
pub struct Listener {
    pub local_addr: Multiaddr,
    pub incoming: BoxStream<'static, Result<Inbound, TransportError>>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this transport can dial or listen on `addr`.
    fn handles(&self, addr: &Multiaddr) -> bool;

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedStream, TransportError>;

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError>;
}

/// Ordered set of transports. The first one that handles an address wins.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Transport>(&mut self, transport: T) {
        tracing::debug!(transport = transport.name(), "registered transport");
        self.transports.push(Arc::new(transport));
    }

    pub fn with<T: Transport>(mut self, transport: T) -> Self {
        self.register(transport);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    pub fn supports(&self, addr: &Multiaddr) -> bool {
        self.select(addr).is_ok()
    }

    fn select(&self, addr: &Multiaddr) -> Result<&Arc<dyn Transport>, TransportError> {
        self.transports
            .iter()
            .find(|t| t.handles(addr))
            .ok_or_else(|| TransportError::Unsupported(addr.clone()))
    }

    /// Dial `addr`, giving up after `timeout`. A stream that completes after
    /// the deadline is dropped together with the cancelled future.
    pub async fn dial(
        &self,
        addr: &Multiaddr,
        timeout: Duration,
    ) -> Result<BoxedStream, TransportError> {
        let transport = self.select(addr)?;
        match tokio::time::timeout(timeout, transport.dial(addr)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::DialTimeout { addr: addr.clone(), timeout }),
        }
    }

    pub async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let transport = self.select(addr)?;
        let listener = transport.listen(addr).await?;
        tracing::info!(transport = transport.name(), addr = %listener.local_addr, "listening");
        Ok(listener)
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry").field("transports", &self.names()).finish()
    }
}
