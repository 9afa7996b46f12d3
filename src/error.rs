//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Persistence directory is locked by another process")]
    Locked,

    #[error("Malformed mutation for {namespace}: {reason}")]
    MalformedMutation { namespace: String, reason: String },

    #[error("Reconciliation conflict on {namespace} (cache key {cache_key})")]
    ReconciliationConflict { namespace: String, cache_key: String },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("No pending optimistic update for correlation {0}")]
    UnknownCorrelation(String),

    #[error("No conflict recorded on {0}")]
    NoConflict(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    pub(crate) fn malformed(namespace: &str, reason: impl Into<String>) -> Self {
        SyncError::MalformedMutation {
            namespace: namespace.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
