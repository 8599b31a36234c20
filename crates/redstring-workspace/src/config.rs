// config.rs — Registry configuration.
//
// Loaded from `redstring.toml`:
//
//   state_dir = "/home/me/.local/share/redstring"
//   init_timeout_ms = 5000
//   cache_quota_bytes = 52428800
//   remote_empty_policy = "prefer_cache"
//   discovery_root = "universes"
//
//   [sync]
//   tick_interval_ms = 5000
//
//   [provider]
//   branch = "main"
//
// `for_state_dir()` lays out everything the registry writes under one
// directory: `workspaces.json`, `cache/`, and `files/` for local documents
// given by relative path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use redstring_storage::ProviderConfig;
use redstring_sync::SyncConfig;

use crate::error::WorkspaceError;

/// What to do when the remote is the source of truth but holds an empty
/// document while the cache has content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteEmptyPolicy {
    /// Keep the cached snapshot rather than replacing it with nothing.
    #[default]
    PreferCache,
    /// Load the empty remote document as-is.
    TrustRemote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Root for registry metadata, cache snapshots and relative local files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Hard limit on eager hydration during `initialize()`.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    #[serde(default = "default_cache_quota_bytes")]
    pub cache_quota_bytes: u64,

    #[serde(default)]
    pub remote_empty_policy: RemoteEmptyPolicy,

    /// Directory discovery walks inside a repository.
    #[serde(default = "default_discovery_root")]
    pub discovery_root: String,

    /// Maximum directory depth below `discovery_root`.
    #[serde(default = "default_discovery_max_depth")]
    pub discovery_max_depth: usize,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::for_state_dir(default_state_dir())
    }
}

impl RegistryConfig {
    /// Standard layout under `state_dir`.
    pub fn for_state_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            init_timeout_ms: default_init_timeout_ms(),
            cache_quota_bytes: default_cache_quota_bytes(),
            remote_empty_policy: RemoteEmptyPolicy::default(),
            discovery_root: default_discovery_root(),
            discovery_max_depth: default_discovery_max_depth(),
            sync: SyncConfig::default(),
            provider: ProviderConfig::default(),
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let content = std::fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| WorkspaceError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load if the file exists, otherwise defaults. A present but invalid
    /// file is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring invalid registry config");
            Self::default()
        })
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.state_dir.join("workspaces.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.state_dir.join("files")
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

// Serde default functions
fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("redstring"))
        .unwrap_or_else(|| PathBuf::from(".redstring"))
}

fn default_init_timeout_ms() -> u64 {
    5_000
}

fn default_cache_quota_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_discovery_root() -> String {
    "universes".to_string()
}

fn default_discovery_max_depth() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_state_dir_layout() {
        let config = RegistryConfig::for_state_dir("/tmp/rs");
        assert_eq!(config.metadata_path(), PathBuf::from("/tmp/rs/workspaces.json"));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/rs/cache"));
        assert_eq!(config.init_timeout(), Duration::from_secs(5));
        assert_eq!(config.remote_empty_policy, RemoteEmptyPolicy::PreferCache);
    }

    #[test]
    fn load_parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redstring.toml");
        std::fs::write(
            &path,
            r#"
state_dir = "/data/rs"
remote_empty_policy = "trust_remote"

[sync]
max_pending = 4

[provider]
branch = "trunk"
"#,
        )
        .unwrap();

        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/data/rs"));
        assert_eq!(config.remote_empty_policy, RemoteEmptyPolicy::TrustRemote);
        assert_eq!(config.sync.max_pending, 4);
        assert_eq!(config.sync.tick_interval_ms, 5_000);
        assert_eq!(config.provider.branch, "trunk");
        assert_eq!(config.provider.api_base, "https://api.github.com");
    }

    #[test]
    fn load_or_default_handles_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = RegistryConfig::load_or_default(&dir.path().join("nope.toml"));
        assert_eq!(missing.init_timeout_ms, 5_000);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "state_dir = [").unwrap();
        assert!(RegistryConfig::load(&bad).is_err());
        assert_eq!(RegistryConfig::load_or_default(&bad).discovery_root, "universes");
    }
}
