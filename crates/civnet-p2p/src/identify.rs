//! Identify exchange.
//!
//! Right after the secure handshake, before multiplexing starts, both ends
//! send one `IdentifyInfo` over the encrypted channel and read the other's.
//! That is how a node learns where a peer that dialed it can be reached.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use civnet_core::constants::{IDENTIFY_PROTOCOL_VERSION, MAX_IDENTIFY_ADDRS};
use civnet_core::{Multiaddr, Protocol};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secure::{SecureChannel, SecurityError};

#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("identify timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed before identify")]
    UnexpectedEof,

    #[error("malformed identify message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// What a node tells every peer it connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub protocol_version: String,
    pub agent_version: String,
    /// Addresses the sender listens on, without `/p2p` suffixes.
    pub listen_addrs: Vec<Multiaddr>,
}

impl IdentifyInfo {
    pub fn new(listen_addrs: Vec<Multiaddr>) -> Self {
        Self {
            protocol_version: IDENTIFY_PROTOCOL_VERSION.to_string(),
            agent_version: concat!("civnet/", env!("CARGO_PKG_VERSION")).to_string(),
            listen_addrs,
        }
    }

    /// Listen addresses with wildcard IPs (`0.0.0.0`, `::`) replaced by the
    /// IP the connection was actually seen from. Addresses that stay
    /// wildcards are dropped.
    pub fn dialable_addrs(&self, observed: &Multiaddr) -> Vec<Multiaddr> {
        let observed_ip = observed.iter().next().filter(|p| matches!(p, Protocol::Ip4(_) | Protocol::Ip6(_)));
        self.listen_addrs
            .iter()
            .filter_map(|addr| {
                let mut parts = addr.iter();
                match parts.next()? {
                    Protocol::Ip4(ip) if ip == Ipv4Addr::UNSPECIFIED => {
                        Some(std::iter::once(observed_ip.clone()?).chain(parts).collect())
                    }
                    Protocol::Ip6(ip) if ip == Ipv6Addr::UNSPECIFIED => {
                        Some(std::iter::once(observed_ip.clone()?).chain(parts).collect())
                    }
                    _ => Some(addr.clone()),
                }
            })
            .collect()
    }
}

/// Send `local` and read the remote's info, bounded by `timeout`.
pub async fn exchange(
    channel: &mut SecureChannel,
    local: &IdentifyInfo,
    timeout: Duration,
) -> Result<IdentifyInfo, IdentifyError> {
    let bytes = bincode::serialize(local).map_err(|e| IdentifyError::Malformed(e.to_string()))?;
    let exchange = async {
        channel.send(&bytes).await?;
        let reply = channel.recv().await?.ok_or(IdentifyError::UnexpectedEof)?;
        let mut remote: IdentifyInfo =
            bincode::deserialize(&reply).map_err(|e| IdentifyError::Malformed(e.to_string()))?;
        remote.listen_addrs.truncate(MAX_IDENTIFY_ADDRS);
        Ok(remote)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| IdentifyError::Timeout(timeout))?
}
