//! Secure channel negotiation.
//!
//! Three length-prefixed messages upgrade a raw stream:
//!
//! ```text
//!   initiator                                   responder
//!   Init { version, identity_key, kem_pk, n_i } ──▶
//!        ◀── Response { identity_key, kem_ct, n_r, sig_r(transcript) }
//!   Finish { sig_i(transcript ‖ "initiator") }  ──▶
//! ```
//!
//! The transcript hash covers the exact bytes of `Init` plus the responder's
//! key, ciphertext and nonce, so both signatures bind the ephemeral Kyber
//! exchange to the long-term Dilithium identities. Each direction then gets
//! its own ChaCha20-Poly1305 key derived from the KEM secret and transcript.

use std::io;
use std::time::Duration;

use civnet_core::constants::{
    AEAD_TAG_LEN, KDF_CONTEXT_INITIATOR, KDF_CONTEXT_RESPONDER, MAX_FRAME_PAYLOAD,
    MAX_HANDSHAKE_MESSAGE, SECURE_PROTOCOL_VERSION,
};
use civnet_core::types::{Direction, IdentityPublicKey, IdentitySignature, PeerId};
use civnet_crypto::{
    derive_traffic_key, encapsulate, peer_id_from_pubkey, CryptoError, EphemeralKem,
    FrameCipher, PeerIdentity, SignatureError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use crate::transport::BoxedStream;

const TRANSCRIPT_DOMAIN: &[u8] = b"civnet-handshake-v1";
const INITIATOR_SUFFIX: &[u8] = b"initiator";

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("peer identity mismatch: expected {expected}, got {actual}")]
    PeerIdentityMismatch { expected: PeerId, actual: PeerId },

    #[error("unsupported secure channel version {0}")]
    UnsupportedVersion(u8),

    #[error("remote signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("{0}")]
    Crypto(#[from] CryptoError),

    #[error("malformed handshake message: {0}")]
    Malformed(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connection closed during handshake")]
    UnexpectedEof,

    #[error("channel terminated after a previous security failure")]
    Terminated,

    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

// ── Handshake messages ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Init {
    version: u8,
    identity_key: IdentityPublicKey,
    kem_public_key: Vec<u8>,
    nonce: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct Response {
    identity_key: IdentityPublicKey,
    kem_ciphertext: Vec<u8>,
    nonce: [u8; 32],
    signature: IdentitySignature,
}

#[derive(Serialize, Deserialize)]
struct Finish {
    signature: IdentitySignature,
}

fn transcript_hash(init_bytes: &[u8], responder_key: &IdentityPublicKey, ct: &[u8], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    for part in [init_bytes, responder_key.0.as_slice(), ct, nonce] {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

fn initiator_proof(transcript: &[u8; 32]) -> Vec<u8> {
    [&transcript[..], INITIATOR_SUFFIX].concat()
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SecurityError> {
    bincode::deserialize(bytes).map_err(|e| SecurityError::Malformed(e.to_string()))
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, SecurityError> {
    bincode::serialize(msg).map_err(|e| SecurityError::Malformed(e.to_string()))
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Read one u32-BE length-prefixed frame. `Ok(None)` on a clean EOF at a
/// frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(
    io: &mut R,
    max: usize,
) -> Result<Option<Vec<u8>>, SecurityError> {
    let len = match io.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(SecurityError::FrameTooLarge { len, max });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, bytes: &[u8]) -> Result<(), SecurityError> {
    io.write_u32(bytes.len() as u32).await?;
    io.write_all(bytes).await?;
    io.flush().await?;
    Ok(())
}

async fn read_handshake<R: AsyncRead + Unpin>(io: &mut R) -> Result<Vec<u8>, SecurityError> {
    read_frame(io, MAX_HANDSHAKE_MESSAGE).await?.ok_or(SecurityError::UnexpectedEof)
}

// ── Negotiator ───────────────────────────────────────────────────────────────

/// Upgrades raw streams into authenticated, encrypted channels.
#[derive(Debug, Clone)]
pub struct Negotiator {
    handshake_timeout: Duration,
}

impl Negotiator {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the handshake over `stream`. `Outbound` plays the initiator.
    ///
    /// When `expected` is set, the remote must prove ownership of exactly that
    /// peer id. On any error, including the timeout, `stream` is dropped
    /// before this returns.
    pub async fn upgrade(
        &self,
        stream: BoxedStream,
        local: &PeerIdentity,
        direction: Direction,
        expected: Option<PeerId>,
    ) -> Result<SecureChannel, SecurityError> {
        let handshake = async move {
            match direction {
                Direction::Outbound => initiate(stream, local, expected).await,
                Direction::Inbound => respond(stream, local, expected).await,
            }
        };
        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| SecurityError::HandshakeTimeout(self.handshake_timeout))?
    }
}

fn check_expected(expected: Option<PeerId>, actual: PeerId) -> Result<(), SecurityError> {
    match expected {
        Some(expected) if expected != actual => {
            Err(SecurityError::PeerIdentityMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

async fn initiate(
    mut stream: BoxedStream,
    local: &PeerIdentity,
    expected: Option<PeerId>,
) -> Result<SecureChannel, SecurityError> {
    let kem = EphemeralKem::generate();
    let init = Init {
        version: SECURE_PROTOCOL_VERSION,
        identity_key: local.public_key().clone(),
        kem_public_key: kem.public_key_bytes(),
        nonce: rand::random(),
    };
    let init_bytes = encode(&init)?;
    write_frame(&mut stream, &init_bytes).await?;

    let response: Response = decode(&read_handshake(&mut stream).await?)?;
    let remote_peer = peer_id_from_pubkey(&response.identity_key.0);
    check_expected(expected, remote_peer)?;

    let transcript = transcript_hash(
        &init_bytes,
        &response.identity_key,
        &response.kem_ciphertext,
        &response.nonce,
    );
    PeerIdentity::verify(&response.identity_key, &transcript, &response.signature)?;
    let secret = kem.decapsulate(&response.kem_ciphertext)?;

    let finish = Finish { signature: local.sign(&initiator_proof(&transcript))? };
    write_frame(&mut stream, &encode(&finish)?).await?;

    let send_key = derive_traffic_key(KDF_CONTEXT_INITIATOR, &secret, &transcript);
    let recv_key = derive_traffic_key(KDF_CONTEXT_RESPONDER, &secret, &transcript);
    debug!(peer = %remote_peer, "secure channel established (initiator)");
    Ok(SecureChannel::new(stream, remote_peer, response.identity_key, send_key, recv_key))
}

async fn respond(
    mut stream: BoxedStream,
    local: &PeerIdentity,
    expected: Option<PeerId>,
) -> Result<SecureChannel, SecurityError> {
    let init_bytes = read_handshake(&mut stream).await?;
    let init: Init = decode(&init_bytes)?;
    if init.version != SECURE_PROTOCOL_VERSION {
        return Err(SecurityError::UnsupportedVersion(init.version));
    }
    let remote_peer = peer_id_from_pubkey(&init.identity_key.0);
    check_expected(expected, remote_peer)?;

    let (secret, kem_ciphertext) = encapsulate(&init.kem_public_key)?;
    let nonce: [u8; 32] = rand::random();
    let transcript = transcript_hash(&init_bytes, local.public_key(), &kem_ciphertext, &nonce);
    let response = Response {
        identity_key: local.public_key().clone(),
        kem_ciphertext,
        nonce,
        signature: local.sign(&transcript)?,
    };
    write_frame(&mut stream, &encode(&response)?).await?;

    let finish: Finish = decode(&read_handshake(&mut stream).await?)?;
    PeerIdentity::verify(&init.identity_key, &initiator_proof(&transcript), &finish.signature)?;

    let send_key = derive_traffic_key(KDF_CONTEXT_RESPONDER, &secret, &transcript);
    let recv_key = derive_traffic_key(KDF_CONTEXT_INITIATOR, &secret, &transcript);
    debug!(peer = %remote_peer, "secure channel established (responder)");
    Ok(SecureChannel::new(stream, remote_peer, init.identity_key, send_key, recv_key))
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// Receiving half. After the first failure every further `recv` returns
/// `SecurityError::Terminated`.
pub struct SecureReader {
    io: ReadHalf<BoxedStream>,
    cipher: FrameCipher,
    terminated: bool,
}

impl SecureReader {
    /// Next decrypted message, or `None` once the remote closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, SecurityError> {
        if self.terminated {
            return Err(SecurityError::Terminated);
        }
        let result = self.recv_inner().await;
        if result.is_err() {
            self.terminated = true;
        }
        result
    }

    async fn recv_inner(&mut self) -> Result<Option<Vec<u8>>, SecurityError> {
        let Some(sealed) = read_frame(&mut self.io, MAX_FRAME_PAYLOAD + AEAD_TAG_LEN).await? else {
            return Ok(None);
        };
        Ok(Some(self.cipher.open(&sealed)?))
    }
}

/// Sending half.
pub struct SecureWriter {
    io: WriteHalf<BoxedStream>,
    cipher: FrameCipher,
}

impl SecureWriter {
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), SecurityError> {
        if plaintext.len() > MAX_FRAME_PAYLOAD {
            return Err(SecurityError::FrameTooLarge { len: plaintext.len(), max: MAX_FRAME_PAYLOAD });
        }
        let sealed = self.cipher.seal(plaintext)?;
        write_frame(&mut self.io, &sealed).await
    }

    /// Half-close the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), SecurityError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// An authenticated, encrypted, message-oriented link to one remote peer.
pub struct SecureChannel {
    reader: SecureReader,
    writer: SecureWriter,
    remote_peer: PeerId,
    remote_key: IdentityPublicKey,
}

impl SecureChannel {
    fn new(
        stream: BoxedStream,
        remote_peer: PeerId,
        remote_key: IdentityPublicKey,
        send_key: [u8; 32],
        recv_key: [u8; 32],
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: SecureReader { io: read, cipher: FrameCipher::new(&recv_key), terminated: false },
            writer: SecureWriter { io: write, cipher: FrameCipher::new(&send_key) },
            remote_peer,
            remote_key,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_key(&self) -> &IdentityPublicKey {
        &self.remote_key
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), SecurityError> {
        self.writer.send(plaintext).await
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, SecurityError> {
        self.reader.recv().await
    }

    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel").field("remote_peer", &self.remote_peer).finish()
    }
}
