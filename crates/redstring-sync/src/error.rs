// error.rs — Error types for the sync engine.

use redstring_document::DocumentError;
use redstring_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote tier failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The snapshot could not be rendered or the remote document parsed.
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// The single retry after a conflict also conflicted.
    #[error("conflict on {path} persisted after retry")]
    ConflictPersisted { path: String },

    /// A status sink failed to accept an event.
    #[error("status sink error: {0}")]
    Sink(String),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_auth())
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::ConflictPersisted { .. } => true,
            SyncError::Storage(e) => e.is_conflict(),
            _ => false,
        }
    }
}
