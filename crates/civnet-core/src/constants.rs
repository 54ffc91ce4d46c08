/// ─── civnet Protocol Constants ──────────────────────────────────────────────
///
/// Values shared by both ends of a connection. Changing any of these is a
/// wire-breaking change and must bump `SECURE_PROTOCOL_VERSION`.

// ── Identity ─────────────────────────────────────────────────────────────────

/// Length in bytes of a PeerId (BLAKE3 digest of the identity public key).
pub const PEER_ID_LEN: usize = 32;

// ── Secure channel ───────────────────────────────────────────────────────────

/// Handshake version carried in the initiator's first message.
pub const SECURE_PROTOCOL_VERSION: u8 = 1;

/// Context string for the initiator → responder traffic key.
pub const KDF_CONTEXT_INITIATOR: &str = "civnet secure-channel v1 initiator->responder";

/// Context string for the responder → initiator traffic key.
pub const KDF_CONTEXT_RESPONDER: &str = "civnet secure-channel v1 responder->initiator";

/// Largest plaintext payload carried by one encrypted frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Largest handshake message accepted before the channel is encrypted.
/// Dilithium2 keys and signatures plus a Kyber768 key fit comfortably.
pub const MAX_HANDSHAKE_MESSAGE: usize = 16 * 1024;

/// Poly1305 tag appended to every sealed frame.
pub const AEAD_TAG_LEN: usize = 16;

// ── Connection policy defaults ───────────────────────────────────────────────

pub const DEFAULT_MIN_CONNECTIONS: usize = 0;
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 2_000;

/// How long a peer or address that failed to dial is left out of backfill.
pub const DEFAULT_REDIAL_BACKOFF_MS: u64 = 30_000;

/// Capacity of the node's broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ── Multiplexer defaults ─────────────────────────────────────────────────────

/// Maximum number of concurrently open streams per session.
pub const DEFAULT_MAX_STREAMS: usize = 256;

/// Receive window every stream starts with, in bytes. A sender may have this
/// much unacknowledged data in flight before it waits for a window update.
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;

/// Receive window a session grows each stream to.
pub const DEFAULT_STREAM_WINDOW: u32 = 1024 * 1024;

// ── Identify ─────────────────────────────────────────────────────────────────

/// Protocol version announced in identify.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "civnet/1.0.0";

/// Listen addresses accepted from one identify message.
pub const MAX_IDENTIFY_ADDRS: usize = 32;
