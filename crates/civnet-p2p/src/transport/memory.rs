//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Listeners and dialers meet through a `MemoryHub`, an ordinary value that
//! several transports (and therefore several nodes) can share. Nothing is
//! process-global, so independent hubs never see each other.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use civnet_core::{Multiaddr, MultiaddrExt, Protocol};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use super::{BoxedStream, Inbound, Listener, Transport, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;
const FIRST_EPHEMERAL_PORT: u64 = 1 << 32;

#[derive(Default)]
struct HubState {
    listeners: HashMap<u64, mpsc::Sender<Inbound>>,
}

/// Rendezvous point for `MemoryTransport`s.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    next_port: Arc<AtomicU64>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            next_port: Arc::new(AtomicU64::new(FIRST_EPHEMERAL_PORT)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ephemeral_port(&self) -> u64 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }
}

/// Open/close counters for streams a transport has dialed.
#[derive(Debug, Default)]
pub struct StreamStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl StreamStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Streams opened but not yet released.
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }
}

/// A dialed pipe end that reports its release to `StreamStats` on drop.
struct TrackedStream {
    inner: DuplexStream,
    stats: Arc<StreamStats>,
}

impl TrackedStream {
    fn new(inner: DuplexStream, stats: Arc<StreamStats>) -> Self {
        stats.opened.fetch_add(1, Ordering::SeqCst);
        Self { inner, stats }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Releases a listening port when the listener stream is dropped.
struct PortGuard {
    hub: MemoryHub,
    port: u64,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.hub.lock().listeners.remove(&self.port);
    }
}

/// Transport for `/memory/<port>` addresses.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    dial_stats: Arc<StreamStats>,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub, dial_stats: Arc::default() }
    }

    /// Counters for every stream this transport has dialed.
    pub fn dial_stats(&self) -> Arc<StreamStats> {
        self.dial_stats.clone()
    }

    fn port(addr: &Multiaddr) -> Option<u64> {
        let mut iter = addr.iter();
        let port = match iter.next() {
            Some(Protocol::Memory(port)) => port,
            _ => return None,
        };
        match (iter.next(), iter.next()) {
            (None, _) | (Some(Protocol::P2p(_)), None) => Some(port),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn handles(&self, addr: &Multiaddr) -> bool {
        Self::port(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedStream, TransportError> {
        let port = Self::port(addr).ok_or_else(|| TransportError::Unsupported(addr.clone()))?;
        let refused = || TransportError::Dial {
            addr: addr.clone(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "no memory listener"),
        };

        let listener = self.hub.lock().listeners.get(&port).cloned().ok_or_else(refused)?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let client = TrackedStream::new(client, self.dial_stats.clone());

        let inbound = Inbound {
            stream: Box::new(server),
            local_addr: Multiaddr::memory(port),
            remote_addr: Multiaddr::memory(self.hub.ephemeral_port()),
        };
        listener.send(inbound).await.map_err(|_| refused())?;
        Ok(Box::new(client))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let requested = Self::port(addr).ok_or_else(|| TransportError::Unsupported(addr.clone()))?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        let port = {
            let mut state = self.hub.lock();
            let port = if requested == 0 {
                let mut port = self.hub.ephemeral_port();
                while state.listeners.contains_key(&port) {
                    port = self.hub.ephemeral_port();
                }
                port
            } else {
                requested
            };
            if state.listeners.contains_key(&port) {
                return Err(TransportError::Listen {
                    addr: addr.clone(),
                    source: io::Error::new(io::ErrorKind::AddrInUse, "memory port in use"),
                });
            }
            state.listeners.insert(port, tx);
            port
        };

        let guard = PortGuard { hub: self.hub.clone(), port };
        let incoming = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let inbound = rx.recv().await?;
            Some((Ok::<_, TransportError>(inbound), (rx, guard)))
        })
        .boxed();

        Ok(Listener { local_addr: Multiaddr::memory(port), incoming })
    }
}
