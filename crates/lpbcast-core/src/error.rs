//! Error types for lpbcast core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Payload checksum does not match the stored one
    #[error("checksum mismatch for {id}: computed {computed} != stored {stored}")]
    ChecksumMismatch {
        id: String,
        computed: String,
        stored: String,
    },

    /// Node identifier is empty or malformed
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),
}
