//! Error taxonomy shared across the directory components

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Directory error kinds. These are stable across components: the store, the
/// routing plane, and the publication pipeline all surface this type, and the
/// gRPC layer maps each kind to a fixed status code.
#[derive(Debug, Error)]
pub enum Error {
    /// Nil ref, empty CID, empty referrer type, missing schema version,
    /// empty digest input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown `schema_version` in the canonical codec
    #[error("unsupported record schema version: {0}")]
    UnsupportedVersion(String),

    /// Non-SHA2-256 digest in the CID utilities
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// CID tag unresolvable, referrer absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Blob size mismatch, declared/actual media-type mismatch
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Canonical unmarshal failure
    #[error("malformed record: {0}")]
    BadRecord(String),

    /// Unexpected registry, datastore, or gossip failure
    #[error("internal error: {0}")]
    Internal(String),

    /// Root context fired
    #[error("operation cancelled")]
    Cancelled,

    /// Per-worker deadline exceeded
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    pub fn bad_record(err: impl std::fmt::Display) -> Self {
        Error::BadRecord(err.to_string())
    }

    /// Wrap an unexpected failure, preserving the original message.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}
