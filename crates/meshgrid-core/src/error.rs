//! Error types for the mesh engine

use thiserror::Error;

/// Frame codec failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),

    #[error("path length {0} exceeds maximum")]
    PathTooLong(usize),

    #[error("payload length {0} exceeds maximum")]
    PayloadTooLong(usize),

    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("path is full")]
    PathFull,

    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Cipher failures
///
/// Authentication failures never say which check failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid key")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptionFailed,
}

/// Node-level failures
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transmit queue full")]
    QueueFull,

    #[error("unknown neighbor {0:02x}")]
    UnknownNeighbor(u8),

    #[error("unknown channel {0:?}")]
    UnknownChannel(String),

    #[error("no shared secret for neighbor {0:02x}")]
    NoSharedSecret(u8),

    #[error("message too long: {0} bytes")]
    MessageTooLong(usize),

    #[error("replayed sequence number {0}")]
    Replay(u32),

    #[error("radio error: {0}")]
    Radio(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Storage(err.to_string())
    }
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
