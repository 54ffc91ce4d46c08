use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerIdError {
    #[error("invalid base58 peer id: {0}")]
    Encoding(String),

    #[error("peer id is not an identity multihash")]
    UnsupportedMultihash,

    #[error("invalid peer id length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}
