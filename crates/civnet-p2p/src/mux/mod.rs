//! Stream multiplexing over a secure channel.
//!
//! One `MuxSession` carries many independent, ordered, bidirectional
//! streams. Frames are tagged with a stream id; the dialer allocates odd ids
//! and the listener even ones, each side counting upwards, so ids are never
//! reused within a session.
//!
//! Flow control is per stream and credit based. A sender may have at most
//! the receiver's window of unread bytes in flight; once it is spent,
//! `MuxStream::write` waits until the reader consumes data and returns
//! credit with a `WindowUpdate`. Every stream starts at
//! `INITIAL_STREAM_WINDOW` and is grown to `MuxConfig::stream_window` by its
//! receiver. A slow reader therefore stalls only its own stream's writer;
//! sibling streams keep their own credit. Data beyond the granted window is
//! a protocol violation and resets the stream.

pub mod frame;
pub mod session;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use civnet_core::types::Direction;
use thiserror::Error;

use crate::config::MuxConfig;
use crate::secure::{SecureChannel, SecurityError};

pub use frame::{Frame, FrameKind};
pub use session::{MuxSession, MuxStream};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("session is closed")]
    Closed,

    #[error("stream {0} is closed for writing")]
    StreamClosed(u32),

    #[error("stream {0} was reset")]
    StreamReset(u32),

    #[error("too many open streams (limit {0})")]
    TooManyStreams(usize),

    #[error("stream ids exhausted")]
    IdsExhausted,

    #[error("frame codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// A multiplexed session as seen by its owner.
#[async_trait]
pub trait MuxedSession: Send + Sync + 'static {
    /// Open a new outbound stream. Fails with `MuxError::Closed` once the
    /// session is closing.
    async fn open_stream(&self) -> Result<MuxStream, MuxError>;

    /// Next stream opened by the remote side. `None` once the session has
    /// ended; after that it never yields again.
    async fn next_inbound(&self) -> Option<MuxStream>;

    /// Round-trip time of one ping.
    async fn ping(&self) -> Result<Duration, MuxError>;

    /// Close every stream and the underlying channel.
    async fn close(&self) -> Result<(), MuxError>;

    /// When a frame last crossed the session in either direction.
    fn last_activity(&self) -> Instant;

    fn is_closed(&self) -> bool;
}

/// Turns secure channels into multiplexed sessions.
#[derive(Debug, Clone, Default)]
pub struct Multiplexer {
    config: MuxConfig,
}

impl Multiplexer {
    pub fn new(config: MuxConfig) -> Self {
        Self { config }
    }

    /// Start a session over `channel`. `direction` decides stream-id parity:
    /// the outbound side opens odd ids. Must be called within a tokio runtime.
    pub fn upgrade(&self, channel: SecureChannel, direction: Direction) -> MuxSession {
        MuxSession::spawn(channel, direction, self.config.clone())
    }
}
