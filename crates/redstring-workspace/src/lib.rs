//! # redstring-workspace
//!
//! The Workspace Registry: the set of workspaces, where each one is stored,
//! and which one is active.
//!
//! ## Key components
//!
//! - [`Workspace`] — one knowledge-graph dataset plus its local / remote /
//!   cache tier configuration, kept consistent by [`Workspace::normalize`].
//! - [`WorkspaceRegistry`] — load / save / switch orchestration across the
//!   tiers, lazy sync-engine provisioning with one engine per slug, and
//!   persistence of the workspace list to `workspaces.json`.
//! - [`DiscoveryService`] — finds existing workspace documents inside a
//!   remote repository and derives names and slugs for them.
//! - [`RegistryConfig`] — TOML configuration for the whole stack.

pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod slug;
pub mod store;
pub mod workspace;

pub use config::{RegistryConfig, RemoteEmptyPolicy};
pub use discovery::{DiscoveredWorkspace, DiscoveryReport, DiscoveryService, DiscoveryStats};
pub use error::{TierFailure, WorkspaceError};
pub use registry::{
    RegistryBuilder, SaveReport, SwitchOptions, WorkspaceRegistry, DEFAULT_WORKSPACE_NAME,
};
pub use slug::{slugify, unique_slug};
pub use store::{RegistrySnapshot, RegistryStore};
pub use workspace::{
    CacheSlotConfig, LocalFileConfig, RemoteRepoConfig, Workspace, WorkspaceMetadata,
    WorkspaceOptions, WorkspaceUpdate,
};
