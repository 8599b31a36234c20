//! # redstring-sync
//!
//! The background agent that keeps one workspace's remote tier current.
//!
//! - [`SyncEngine`] — debounced committer with shadow backups and the
//!   conflict policy (remote wins when it is the source of truth; otherwise
//!   one delayed retry).
//! - [`PendingQueue`] — bounded queue of snapshots awaiting commit.
//! - [`StatusEvent`] / [`EventDispatcher`] — status push for outcomes no
//!   caller is waiting on.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod queue;

pub use config::SyncConfig;
pub use engine::{
    CommitOutcome, RemoteTarget, SyncEngine, SyncEngineOptions, SyncStatus, TickOutcome,
};
pub use error::SyncError;
pub use events::{
    ChannelSink, ConflictResolution, EventDispatcher, MemorySink, StatusEvent, StatusSink,
    TracingSink,
};
pub use queue::{PendingChange, PendingQueue};
