use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::PEER_ID_LEN;
use crate::error::PeerIdError;

// ── PeerId ───────────────────────────────────────────────────────────────────

/// 32-byte peer identifier derived as BLAKE3(identity_public_key).
///
/// Text form is base-58 of the identity multihash `0x00 0x20 <bytes>`, the
/// same encoding a `/p2p` multiaddr component uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

/// Multihash code and digest length prefix.
const IDENTITY_MULTIHASH_PREFIX: [u8; 2] = [0x00, PEER_ID_LEN as u8];

impl PeerId {
    pub fn from_bytes(b: [u8; PEER_ID_LEN]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDENTITY_MULTIHASH_PREFIX.len() + PEER_ID_LEN);
        out.extend_from_slice(&IDENTITY_MULTIHASH_PREFIX);
        out.extend_from_slice(&self.0);
        out
    }

    pub fn from_multihash(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let digest = bytes
            .strip_prefix(&IDENTITY_MULTIHASH_PREFIX[..])
            .ok_or(PeerIdError::UnsupportedMultihash)?;
        let arr: [u8; PEER_ID_LEN] = digest.try_into().map_err(|_| PeerIdError::InvalidLength {
            expected: PEER_ID_LEN,
            got: digest.len(),
        })?;
        Ok(Self(arr))
    }

    /// Base-58 encoded string representation.
    pub fn to_b58(&self) -> String {
        bs58::encode(self.to_multihash()).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, PeerIdError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| PeerIdError::Encoding(e.to_string()))?;
        Self::from_multihash(&bytes)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_b58(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The multihash prefix is shared, so show the tail.
        let s = self.to_b58();
        write!(f, "PeerId(..{})", &s[s.len().saturating_sub(8)..])
    }
}

// ── IdentityPublicKey ────────────────────────────────────────────────────────

/// Dilithium2 public key (1312 bytes per NIST FIPS 204).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKey(pub Vec<u8>);

impl IdentityPublicKey {
    /// Short hex fingerprint used in logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({}b, {})", self.0.len(), self.fingerprint())
    }
}

/// Dilithium2 detached signature (2420 bytes per NIST FIPS 204).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignature(pub Vec<u8>);

impl fmt::Debug for IdentitySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentitySignature({}b)", self.0.len())
    }
}

// ── Connection direction ─────────────────────────────────────────────────────

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// We dialed the remote peer.
    Outbound,
    /// The remote peer dialed one of our listeners.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}
