use std::time::Duration;

use civnet_core::constants::{
    DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_DIAL_TIMEOUT_MS, DEFAULT_EVENT_CAPACITY,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_STREAMS,
    DEFAULT_MIN_CONNECTIONS, DEFAULT_REDIAL_BACKOFF_MS, DEFAULT_STREAM_WINDOW,
    INITIAL_STREAM_WINDOW,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("maxConnections must be at least 1")]
    MaxConnectionsZero,

    #[error("minConnections ({min}) exceeds maxConnections ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("mux.streamWindow ({got}) is below the initial window ({min})")]
    StreamWindowTooSmall { min: u32, got: u32 },
}

/// Stream multiplexer limits, per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MuxConfig {
    /// Concurrently open streams, counting both directions.
    pub max_streams: usize,
    /// Receive window per stream, in bytes. Writers wait once this much
    /// unread data is in flight.
    pub stream_window: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self { max_streams: DEFAULT_MAX_STREAMS, stream_window: DEFAULT_STREAM_WINDOW }
    }
}

/// Configuration for a civnet node.
///
/// Field names follow the camelCase keys of the JSON config file; every key
/// is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    /// Local listen addresses (e.g. "/ip4/0.0.0.0/tcp/7777").
    pub listen_addrs: Vec<String>,
    /// Bootstrap peer multiaddresses. Unparseable entries are skipped.
    pub bootstrap_list: Vec<String>,
    /// Advisory lower bound; see `ConnectionManager::below_min_connections`.
    pub min_connections: usize,
    /// Hard upper bound on live plus in-flight connections.
    pub max_connections: usize,
    /// Dial discovered peers automatically.
    pub auto_dial: bool,
    pub handshake_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub close_timeout_ms: u64,
    /// Backfill leaves a peer alone this long after a failed dial.
    pub redial_backoff_ms: u64,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    pub mux: MuxConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/7777".into()],
            bootstrap_list: Vec::new(),
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_dial: true,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            redial_backoff_ms: DEFAULT_REDIAL_BACKOFF_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            mux: MuxConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::MaxConnectionsZero);
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_connections,
                max: self.max_connections,
            });
        }
        let positive = [
            ("handshakeTimeoutMs", self.handshake_timeout_ms),
            ("dialTimeoutMs", self.dial_timeout_ms),
            ("closeTimeoutMs", self.close_timeout_ms),
            ("redialBackoffMs", self.redial_backoff_ms),
            ("eventCapacity", self.event_capacity as u64),
            ("mux.maxStreams", self.mux.max_streams as u64),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(name));
        }
        if self.mux.stream_window < INITIAL_STREAM_WINDOW {
            return Err(ConfigError::StreamWindowTooSmall {
                min: INITIAL_STREAM_WINDOW,
                got: self.mux.stream_window,
            });
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn redial_backoff(&self) -> Duration {
        Duration::from_millis(self.redial_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.auto_dial);
        assert_eq!(config.listen_addrs, vec!["/ip4/0.0.0.0/tcp/7777".to_string()]);
    }

    #[test]
    fn rejects_inconsistent_limits() {
        let config = NodeConfig { max_connections: 0, ..NodeConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::MaxConnectionsZero));

        let config = NodeConfig { min_connections: 3, max_connections: 2, ..NodeConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::MinExceedsMax { min: 3, max: 2 }));

        let config = NodeConfig { handshake_timeout_ms: 0, ..NodeConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("handshakeTimeoutMs")));

        let config = NodeConfig { redial_backoff_ms: 0, ..NodeConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("redialBackoffMs")));
    }

    #[test]
    fn stream_window_cannot_shrink_below_the_initial_window() {
        let mut config = NodeConfig::default();
        config.mux.stream_window = INITIAL_STREAM_WINDOW - 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::StreamWindowTooSmall { min: INITIAL_STREAM_WINDOW, got: INITIAL_STREAM_WINDOW - 1 })
        );
        config.mux.stream_window = INITIAL_STREAM_WINDOW;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_uses_camel_case_and_fills_defaults() {
        let json = r#"{
            "minConnections": 1,
            "maxConnections": 2,
            "autoDial": false,
            "bootstrapList": ["/memory/1"],
            "mux": { "maxStreams": 8 }
        }"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 2);
        assert!(!config.auto_dial);
        assert_eq!(config.bootstrap_list, vec!["/memory/1".to_string()]);
        assert_eq!(config.mux.max_streams, 8);
        assert_eq!(config.mux.stream_window, DEFAULT_STREAM_WINDOW);
        assert_eq!(config.redial_backoff_ms, DEFAULT_REDIAL_BACKOFF_MS);
        assert_eq!(config.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
    }
}
