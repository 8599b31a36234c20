// error.rs — Error types for the command bridge.

use redstring_workspace::WorkspaceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid payload for {command}: {message}")]
    InvalidPayload { command: String, message: String },

    /// No response arrived within the client-side timeout.
    #[error("command '{command}' timed out after {millis}ms")]
    Timeout { command: String, millis: u64 },

    /// Readiness carried an initialization error; queued and later
    /// commands are rejected with it.
    #[error("registry failed to initialize: {0}")]
    InitFailed(String),

    #[error("bridge channel closed")]
    ChannelClosed,

    /// The registry answered with `{error}`.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}
