use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use civnet_core::{Multiaddr, MultiaddrExt, Protocol};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::trace;

use super::{BoxedStream, Inbound, Listener, Transport, TransportError};

/// Plain TCP via tokio. Handles `/{ip4,ip6,dns,dns4,dns6}/<host>/tcp/<port>`
/// with an optional trailing `/p2p/<id>`.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

enum Host {
    Ip(IpAddr),
    Name(String),
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    fn split(addr: &Multiaddr) -> Option<(Host, u16)> {
        let mut iter = addr.iter();
        let host = match iter.next()? {
            Protocol::Ip4(ip) => Host::Ip(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => Host::Ip(IpAddr::V6(ip)),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) => Host::Name(h.into_owned()),
            _ => return None,
        };
        let port = match iter.next()? {
            Protocol::Tcp(port) => port,
            _ => return None,
        };
        match iter.next() {
            None | Some(Protocol::P2p(_)) => Some((host, port)),
            Some(_) => None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn handles(&self, addr: &Multiaddr) -> bool {
        Self::split(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedStream, TransportError> {
        let dial_err = |source: io::Error| TransportError::Dial { addr: addr.clone(), source };
        let (host, port) = Self::split(addr).ok_or_else(|| TransportError::Unsupported(addr.clone()))?;
        let stream = match host {
            Host::Ip(ip) => TcpStream::connect(SocketAddr::new(ip, port)).await,
            Host::Name(name) => TcpStream::connect((name.as_str(), port)).await,
        }
        .map_err(dial_err)?;
        stream.set_nodelay(self.nodelay).map_err(dial_err)?;
        trace!(%addr, "tcp connected");
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let listen_err = |source: io::Error| TransportError::Listen { addr: addr.clone(), source };
        let socket = match Self::split(addr) {
            Some((Host::Ip(ip), port)) => SocketAddr::new(ip, port),
            Some((Host::Name(_), _)) => {
                return Err(listen_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot listen on a DNS name",
                )))
            }
            None => return Err(TransportError::Unsupported(addr.clone())),
        };

        let listener = TcpListener::bind(socket).await.map_err(listen_err)?;
        let local_addr = Multiaddr::from_socket(listener.local_addr().map_err(listen_err)?);
        let nodelay = self.nodelay;
        let bound = local_addr.clone();

        let incoming = TcpListenerStream::new(listener)
            .map(move |accepted| -> Result<Inbound, TransportError> {
                let stream = accepted.map_err(TransportError::Accept)?;
                let _ = stream.set_nodelay(nodelay);
                let remote_addr = Multiaddr::from_socket(stream.peer_addr().map_err(TransportError::Accept)?);
                Ok(Inbound {
                    stream: Box::new(stream) as BoxedStream,
                    local_addr: bound.clone(),
                    remote_addr,
                })
            })
            .boxed();

        Ok(Listener { local_addr, incoming })
    }
}
