//! Per-direction AEAD for secure-channel frames.
//!
//! Each direction owns one `FrameCipher`. Nonces are a 64-bit counter that
//! both sides advance in lockstep, so a dropped, replayed or reordered frame
//! fails authentication exactly like a corrupted one.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("frame authentication failed (counter {counter})")]
    Decrypt { counter: u64 },

    #[error("frame encryption failed")]
    Encrypt,

    #[error("nonce counter exhausted")]
    NonceExhausted,

    #[error("invalid KEM {0}")]
    InvalidKemMaterial(&'static str),
}

pub struct FrameCipher {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { aead: ChaCha20Poly1305::new(Key::from_slice(key)), counter: 0 }
    }

    /// Number of frames processed so far in this direction.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        self.aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.counter;
        let nonce = self.next_nonce()?;
        self.aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt { counter })
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(nonce)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameCipher {{ counter: {} }}", self.counter)
    }
}
