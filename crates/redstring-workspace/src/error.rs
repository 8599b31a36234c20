// error.rs — Error types for the workspace registry.

use std::path::PathBuf;

use redstring_document::DocumentError;
use redstring_storage::{StorageError, Tier};
use redstring_sync::SyncError;
use thiserror::Error;

/// One tier's failure inside a multi-tier operation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TierFailure {
    pub tier: Tier,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace not found: {slug}")]
    NotFound { slug: String },

    #[error("workspace '{slug}' is the last one and cannot be deleted")]
    LastWorkspace { slug: String },

    #[error("invalid workspace name: {0:?}")]
    InvalidName(String),

    /// A live sync engine is already bound to this slug.
    #[error("a sync engine is already registered for workspace '{slug}'")]
    EngineAlreadyRegistered { slug: String },

    /// Every enabled tier failed during a save.
    #[error("all tiers failed for workspace '{slug}': {}", describe(.failures))]
    AllTiersFailed {
        slug: String,
        failures: Vec<TierFailure>,
    },

    /// Discovery or linking needs a remote provider and none is configured.
    #[error("no remote provider configured")]
    NoProvider,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn describe(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.tier, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl WorkspaceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkspaceError::NotFound { .. })
    }
}
