//! # redstring-bridge
//!
//! The request/response channel between a host UI and the workspace
//! registry.
//!
//! - [`BridgeServer`] — answers [`CommandMessage`]s against a
//!   [`WorkspaceRegistry`](redstring_workspace::WorkspaceRegistry) and
//!   forwards every status event.
//! - [`BridgeClient`] — queues calls until the registry reports readiness,
//!   correlates responses by id, and times calls out.
//! - [`serve_lines`] / [`connect_lines`] — newline-delimited JSON framing
//!   over any async byte stream.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{BridgeClient, Readiness, DEFAULT_TIMEOUT};
pub use error::BridgeError;
pub use protocol::{
    response_channel, Command, CommandMessage, CreateWorkspacePayload, LinkPayload,
    RelinkPayload, RepoPayload, ResponseMessage, SavePayload, ServerMessage, SlugPayload,
    SwitchPayload, SyncStatusPayload, UpdateWorkspacePayload,
};
pub use server::BridgeServer;
pub use transport::{connect_lines, serve_lines};
