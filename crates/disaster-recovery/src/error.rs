//! Error types for backup, failover and recovery operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DrError>;

/// Disaster-recovery failures.
#[derive(Error, Debug)]
pub enum DrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("dump failed: {0}")]
    Dump(String),

    #[error("restore failed: {0}")]
    Restore(String),

    #[error("primary endpoint is still unhealthy, failback refused")]
    PrimaryUnhealthy,

    #[error("switchover failed: {0}")]
    Switchover(String),
}

impl common::error::ClassifyError for DrError {
    fn class(&self) -> common::ErrorClass {
        match self {
            DrError::Storage(_) | DrError::Io(_) => common::ErrorClass::Transient,
            DrError::ChecksumMismatch { .. } | DrError::Encryption(_) => common::ErrorClass::Fatal,
            DrError::BackupNotFound(_) | DrError::Serialization(_) => common::ErrorClass::Validation,
            _ => common::ErrorClass::Permanent,
        }
    }
}
