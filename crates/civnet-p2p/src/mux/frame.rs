use serde::{Deserialize, Serialize};

use super::MuxError;

/// Stream id reserved for session-level frames (ping, go-away).
pub const SESSION_STREAM_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// First frame of a new stream. May carry a window credit.
    Open,
    Data,
    /// Sender will write no more on this stream.
    Close,
    /// Abort the stream in both directions.
    Reset,
    Ping,
    Pong,
    /// Sender is closing the whole session.
    GoAway,
    /// Grants the receiver of this frame more send credit on the stream.
    WindowUpdate,
}

/// One multiplexer frame, carried as a single secure-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind) -> Self {
        Self { stream_id, kind, payload: Vec::new() }
    }

    /// Open `stream_id`, granting the remote `credit` bytes on top of the
    /// initial window.
    pub fn open(stream_id: u32, credit: u32) -> Self {
        Self { stream_id, kind: FrameKind::Open, payload: credit_payload(credit) }
    }

    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self { stream_id, kind: FrameKind::WindowUpdate, payload: credit_payload(credit) }
    }

    pub fn data(stream_id: u32, payload: Vec<u8>) -> Self {
        Self { stream_id, kind: FrameKind::Data, payload }
    }

    pub fn ping(nonce: u64) -> Self {
        Self { stream_id: SESSION_STREAM_ID, kind: FrameKind::Ping, payload: nonce.to_be_bytes().to_vec() }
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self { stream_id: SESSION_STREAM_ID, kind: FrameKind::Pong, payload }
    }

    pub fn go_away() -> Self {
        Self::new(SESSION_STREAM_ID, FrameKind::GoAway)
    }

    /// The nonce carried by a ping or pong frame.
    pub fn nonce(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// The credit carried by an open or window-update frame; zero if absent.
    pub fn credit(&self) -> u32 {
        match <[u8; 4]>::try_from(self.payload.as_slice()) {
            Ok(bytes) => u32::from_be_bytes(bytes),
            Err(_) => 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MuxError> {
        bincode::serialize(self).map_err(|e| MuxError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MuxError> {
        bincode::deserialize(bytes).map_err(|e| MuxError::Codec(e.to_string()))
    }
}

fn credit_payload(credit: u32) -> Vec<u8> {
    if credit == 0 {
        Vec::new()
    } else {
        credit.to_be_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_nonce_survives_the_wire() {
        let frame = Frame::decode(&Frame::ping(0xdead_beef).encode().unwrap()).unwrap();
        assert_eq!(frame.kind, FrameKind::Ping);
        assert_eq!(frame.stream_id, SESSION_STREAM_ID);
        assert_eq!(frame.nonce(), Some(0xdead_beef));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(Frame::decode(&[0xff; 3]), Err(MuxError::Codec(_))));
        assert_eq!(Frame::data(1, vec![1, 2, 3]).nonce(), None);
    }

    #[test]
    fn credit_travels_in_open_and_window_update() {
        assert_eq!(Frame::open(3, 0).credit(), 0);
        assert!(Frame::open(3, 0).payload.is_empty());
        let update = Frame::decode(&Frame::window_update(5, 512 * 1024).encode().unwrap()).unwrap();
        assert_eq!(update.kind, FrameKind::WindowUpdate);
        assert_eq!(update.credit(), 512 * 1024);
    }
}
