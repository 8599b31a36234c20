// error.rs — Error types for document parsing and serialization.

use thiserror::Error;

/// Errors that can occur while reading or writing a workspace document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The text is not valid JSON, or a known shape failed to deserialize.
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The JSON parsed, but matches none of the accepted schema shapes.
    #[error("unrecognized document shape (top-level keys: {keys})")]
    UnrecognizedShape { keys: String },

    /// The document is empty (zero bytes or only whitespace).
    #[error("document is empty")]
    Empty,
}
