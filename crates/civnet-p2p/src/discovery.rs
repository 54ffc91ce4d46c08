//! Peer discovery strategies.
//!
//! A strategy only has to emit `PeerRecord`s into the sink it is handed;
//! the node decides what to do with them.

use std::collections::HashSet;

use async_trait::async_trait;
use civnet_core::{parse_multiaddr, DiscoverySource, PeerRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait Discovery: Send + 'static {
    fn name(&self) -> &'static str;

    /// Begin emitting candidates into `sink`. A strategy that keeps running
    /// in the background may hold on to the sender until `stop`.
    async fn start(&mut self, sink: mpsc::Sender<PeerRecord>);

    async fn stop(&mut self);
}

/// Announces a fixed list of addresses, each at most once until reset.
#[derive(Debug, Clone)]
pub struct BootstrapDiscovery {
    entries: Vec<String>,
    emitted: HashSet<PeerRecord>,
}

impl BootstrapDiscovery {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries, emitted: HashSet::new() }
    }

    /// Forget what was already announced, so the next `start` emits the
    /// whole list again.
    pub fn reset(&mut self) {
        self.emitted.clear();
    }

    /// Parse the configured list, skipping and logging malformed entries.
    pub fn records(&self) -> Vec<PeerRecord> {
        self.entries
            .iter()
            .filter_map(|entry| match parse_multiaddr(entry.trim()) {
                Ok(addr) => Some(PeerRecord::from_addr(addr, DiscoverySource::Bootstrap)),
                Err(e) => {
                    warn!(%entry, error = %e, "skipping invalid bootstrap address");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Discovery for BootstrapDiscovery {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    async fn start(&mut self, sink: mpsc::Sender<PeerRecord>) {
        let mut announced = 0;
        for record in self.records() {
            if !self.emitted.insert(record.clone()) {
                continue;
            }
            if sink.send(record).await.is_err() {
                debug!("discovery sink closed");
                return;
            }
            announced += 1;
        }
        debug!(announced, total = self.entries.len(), "bootstrap list announced");
    }

    async fn stop(&mut self) {
        // A stopped node starts over from the full list.
        self.reset();
    }
}
