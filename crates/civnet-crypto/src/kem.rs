//! Kyber768 key encapsulation for the handshake's ephemeral secret.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext, PublicKey, SharedSecret as _};
use zeroize::Zeroizing;

use crate::cipher::CryptoError;

/// Encoded Kyber768 public key as sent on the wire.
pub type KemPublicKey = Vec<u8>;

/// Encoded Kyber768 ciphertext as sent on the wire.
pub type KemCiphertext = Vec<u8>;

/// 32-byte shared secret, wiped on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Single-use keypair held by the handshake initiator.
pub struct EphemeralKem {
    public_key: kyber768::PublicKey,
    secret_key: kyber768::SecretKey,
}

impl EphemeralKem {
    pub fn generate() -> Self {
        let (public_key, secret_key) = kyber768::keypair();
        Self { public_key, secret_key }
    }

    pub fn public_key_bytes(&self) -> KemPublicKey {
        self.public_key.as_bytes().to_vec()
    }

    /// Recover the secret the responder encapsulated to our public key.
    pub fn decapsulate(self, ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        let ct = kyber768::Ciphertext::from_bytes(ciphertext)
            .map_err(|_| CryptoError::InvalidKemMaterial("ciphertext"))?;
        let ss = kyber768::decapsulate(&ct, &self.secret_key);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

/// Responder side: encapsulate a fresh secret to the initiator's key.
pub fn encapsulate(public_key: &[u8]) -> Result<(SharedSecret, KemCiphertext), CryptoError> {
    let pk = kyber768::PublicKey::from_bytes(public_key)
        .map_err(|_| CryptoError::InvalidKemMaterial("public key"))?;
    let (ss, ct) = kyber768::encapsulate(&pk);
    Ok((Zeroizing::new(ss.as_bytes().to_vec()), ct.as_bytes().to_vec()))
}
