//! civnet-crypto
//!
//! Primitives behind the secure channel: Dilithium2 identities, Kyber768
//! key encapsulation, BLAKE3 derivations and the ChaCha20-Poly1305 frame
//! cipher.

pub mod cipher;
pub mod dilithium;
pub mod hash;
pub mod kem;
pub mod keypair;

pub use cipher::{CryptoError, FrameCipher};
pub use dilithium::{verify_signature, SignatureError};
pub use hash::{blake3_hash, derive_traffic_key, peer_id_from_pubkey};
pub use kem::{encapsulate, EphemeralKem, KemCiphertext, KemPublicKey, SharedSecret};
pub use keypair::PeerIdentity;
