// store.rs — RegistryStore: persistence for the workspace list.
//
// The whole registry fits in one pretty-printed JSON file
// (`<state_dir>/workspaces.json`):
//
//   { "version": 1, "activeSlug": "alpha", "workspaces": [ ... ] }
//
// Writes go through a temp file and a rename so a crash mid-write leaves
// the previous list intact.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::workspace::Workspace;

const STORE_VERSION: u32 = 1;

/// What `workspaces.json` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub active_slug: String,
    pub workspaces: Vec<Workspace>,
}

pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved registry. `Ok(None)` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<RegistrySnapshot>, WorkspaceError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path).map_err(|source| WorkspaceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&json)?;
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), WorkspaceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| WorkspaceError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| WorkspaceError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl RegistrySnapshot {
    pub fn new(active_slug: impl Into<String>, workspaces: Vec<Workspace>) -> Self {
        Self {
            version: STORE_VERSION,
            active_slug: active_slug.into(),
            workspaces,
        }
    }
}
