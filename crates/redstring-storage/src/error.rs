// error.rs — The storage failure taxonomy shared by every tier.
//
// Callers branch on the *kind* of failure, not its message: not-found means
// "create fresh", conflict triggers the sync engine's resolution policy,
// auth gets one refresh-and-retry, permission-denied marks the local tier
// for reconnection, quota-exceeded gets one eviction-and-retry.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading or writing a storage tier.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The file or directory does not exist.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// The remote revision no longer matches the one we wrote against.
    #[error("revision conflict on {path} (expected revision {expected:?})")]
    Conflict {
        path: String,
        expected: Option<String>,
    },

    /// Credential missing, expired, or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport failure or unexpected server response.
    #[error("network error: {0}")]
    Network(String),

    /// The local file capability was denied or revoked.
    #[error("permission denied for {path}")]
    PermissionDenied { path: String },

    /// Not enough cache space even after eviction.
    #[error("storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    /// A bounded operation ran out of time.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    /// No provider is configured for this tier.
    #[error("tier unavailable: {0}")]
    Unavailable(String),

    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize or deserialize stored data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored document could not be parsed.
    #[error("document error: {0}")]
    Document(#[from] redstring_document::DocumentError),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, StorageError::Auth(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StorageError::PermissionDenied { .. })
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}
