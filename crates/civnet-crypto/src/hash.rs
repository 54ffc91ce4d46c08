use civnet_core::types::PeerId;

/// Compute BLAKE3 hash of arbitrary bytes → 32-byte array.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive a PeerId from raw identity public key bytes using BLAKE3.
pub fn peer_id_from_pubkey(pubkey_bytes: &[u8]) -> PeerId {
    PeerId::from_bytes(blake3_hash(pubkey_bytes))
}

/// Derive one direction's traffic key from the KEM secret and the handshake
/// transcript hash. `context` separates the two directions.
pub fn derive_traffic_key(context: &str, secret: &[u8], transcript: &[u8; 32]) -> [u8; 32] {
    let mut material = zeroize::Zeroizing::new(Vec::with_capacity(secret.len() + 32));
    material.extend_from_slice(secret);
    material.extend_from_slice(transcript);
    blake3::derive_key(context, &material)
}
