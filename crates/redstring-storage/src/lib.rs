//! # redstring-storage
//!
//! The three persistence tiers a workspace can be stored in, plus the
//! plumbing they share.
//!
//! ## Key components
//!
//! - [`RemoteProvider`] — trait over a Git-hosting contents API. The
//!   production implementation is [`GitHubProvider`]; [`MemoryProvider`] is an
//!   in-process double with revision ids and scriptable failures.
//! - [`LocalFileTier`] — wraps a user-granted [`FileHandle`], checking and
//!   re-requesting permission before every access and flagging the tier
//!   `needs_reconnect` when access is revoked.
//! - [`CacheStore`] — quota-aware snapshot store over a [`CacheBackend`],
//!   evicting old snapshots when space runs out.
//! - [`Clock`] — injectable time source so debouncing, back-off and retry
//!   delays can be driven deterministically in tests ([`ManualClock`]).
//! - [`StorageError`] — the shared failure taxonomy (not-found, conflict,
//!   auth, network, permission, quota, timeout).

pub mod auth;
pub mod cache;
pub mod clock;
pub mod error;
pub mod github;
pub mod local;
pub mod memory;
pub mod remote;
pub mod tier;

pub use auth::{AuthContext, AuthMethod, CredentialSource, StaticCredentials};
pub use cache::{CacheBackend, CacheEntry, CacheStore, DirCacheBackend, MemoryCacheBackend, QuotaEstimate};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use error::StorageError;
pub use github::{GitHubProvider, ProviderConfig};
pub use local::{
    FileHandle, FileHandleFactory, FsFileHandle, FsHandleFactory, HandleStatus, LocalFileTier,
    MemoryFileHandle, MemoryHandleFactory, PermissionState,
};
pub use memory::{MemoryProvider, ProviderOp, ScriptedFailure};
pub use remote::{
    export_all, import_all, write_with_latest_revision, DirEntry, EntryKind, RemoteFile,
    RemoteProvider, RepoRef,
};
pub use tier::{SourceOfTruth, Tier};
