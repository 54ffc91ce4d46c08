use civnet_core::types::{IdentityPublicKey, IdentitySignature, PeerId};
use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::dilithium::{self, SignatureError};
use crate::hash::peer_id_from_pubkey;

/// A node's long-term identity: Dilithium2 keypair plus the derived PeerId.
///
/// Immutable after creation. The secret key lives in a `Zeroizing` buffer,
/// is wiped on drop, and has no serialized form.
pub struct PeerIdentity {
    peer_id: PeerId,
    public_key: IdentityPublicKey,
    secret_key: Zeroizing<Vec<u8>>,
}

impl PeerIdentity {
    /// Generate a fresh Dilithium2 identity.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium2::keypair();
        Self::from_raw(pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
    }

    /// Restore an identity from raw key bytes.
    pub fn from_raw(pk_bytes: Vec<u8>, sk_bytes: Vec<u8>) -> Self {
        Self {
            peer_id: peer_id_from_pubkey(&pk_bytes),
            public_key: IdentityPublicKey(pk_bytes),
            secret_key: Zeroizing::new(sk_bytes),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> &IdentityPublicKey {
        &self.public_key
    }

    /// Sign `message` with this identity's secret key.
    pub fn sign(&self, message: &[u8]) -> Result<IdentitySignature, SignatureError> {
        dilithium::sign(&self.secret_key, message)
    }

    /// Verify a signature made by the holder of `public_key`.
    pub fn verify(
        public_key: &IdentityPublicKey,
        message: &[u8],
        signature: &IdentitySignature,
    ) -> Result<(), SignatureError> {
        dilithium::verify_signature(public_key, message, signature)
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity {{ peer_id: {:?} }}", self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_matches_public_key() {
        let identity = PeerIdentity::generate();
        assert_eq!(identity.peer_id(), peer_id_from_pubkey(&identity.public_key().0));
    }

    #[test]
    fn sign_and_verify() {
        let identity = PeerIdentity::generate();
        let sig = identity.sign(b"hello").unwrap();
        assert!(PeerIdentity::verify(identity.public_key(), b"hello", &sig).is_ok());

        let other = PeerIdentity::generate();
        assert!(PeerIdentity::verify(other.public_key(), b"hello", &sig).is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let identity = PeerIdentity::generate();
        let text = format!("{identity:?}");
        assert!(text.starts_with("PeerIdentity { peer_id: PeerId("));
        assert!(!text.contains("secret"));
    }
}
