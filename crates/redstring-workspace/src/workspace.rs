// workspace.rs — The Workspace record and its tier configuration.
//
// A workspace is one knowledge-graph dataset plus where it is stored:
// an optional local file, an optional remote repository location and a
// cache slot. `normalize()` enforces the configuration invariants after
// every create or update:
//
//   - a remote tier needs a linked repository, a local tier needs a path
//   - at least one tier is enabled (the cache is force-enabled otherwise)
//   - the declared source of truth is an enabled tier (else the first
//     enabled tier in local → remote → cache order)
//   - defaults: cache key `workspace-<slug>`, remote folder
//     `universes/<slug>` when none was given (an explicit empty folder is
//     the repository root), file name `<slug>.redstring`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redstring_document::{ContentStats, DocumentStamp, FILE_EXTENSION};
use redstring_storage::{HandleStatus, RepoRef, SourceOfTruth, Tier};
use redstring_sync::RemoteTarget;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub handle_status: HandleStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepoConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_repo: Option<RepoRef>,
    /// Directory of the document; `""` is the repository root.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub file_name: String,
    /// Repository directory holding the workspace's type schema, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSlotConfig {
    pub enabled: bool,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub stats: ContentStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<DateTime<Utc>>,
}

impl WorkspaceMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            modified: now,
            stats: ContentStats::default(),
            content_hash: None,
            last_saved: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub slug: String,
    pub name: String,
    pub source_of_truth: SourceOfTruth,
    #[serde(default)]
    pub local_file: LocalFileConfig,
    #[serde(default)]
    pub remote_repo: RemoteRepoConfig,
    #[serde(default)]
    pub cache_slot: CacheSlotConfig,
    pub metadata: WorkspaceMetadata,
}

/// Options accepted by `createWorkspace`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceOptions {
    pub source_of_truth: Option<SourceOfTruth>,
    pub enable_local: bool,
    pub local_path: Option<String>,
    pub enable_remote: bool,
    pub linked_repo: Option<RepoRef>,
    pub folder: Option<String>,
    pub file_name: Option<String>,
    pub schema_path: Option<String>,
    /// The cache tier is on unless explicitly disabled.
    pub enable_cache: Option<bool>,
}

/// Partial update accepted by `updateWorkspace`. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceUpdate {
    pub name: Option<String>,
    pub source_of_truth: Option<SourceOfTruth>,
    pub enable_local: Option<bool>,
    pub local_path: Option<String>,
    pub enable_remote: Option<bool>,
    pub linked_repo: Option<RepoRef>,
    pub folder: Option<String>,
    pub file_name: Option<String>,
    pub schema_path: Option<String>,
    pub enable_cache: Option<bool>,
}

impl Workspace {
    /// A cache-only workspace.
    pub fn new(slug: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut workspace = Self {
            slug: slug.into(),
            name: name.into(),
            source_of_truth: SourceOfTruth::Cache,
            local_file: LocalFileConfig::default(),
            remote_repo: RemoteRepoConfig::default(),
            cache_slot: CacheSlotConfig {
                enabled: true,
                key: String::new(),
            },
            metadata: WorkspaceMetadata::new(now),
        };
        workspace.normalize();
        workspace
    }

    pub fn from_options(
        slug: impl Into<String>,
        name: impl Into<String>,
        options: WorkspaceOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let mut workspace = Self::new(slug, name, now);
        workspace.local_file = LocalFileConfig {
            enabled: options.enable_local,
            path: options.local_path,
            handle_status: HandleStatus::Unlinked,
        };
        workspace.remote_repo = RemoteRepoConfig {
            enabled: options.enable_remote,
            linked_repo: options.linked_repo,
            folder: options.folder,
            file_name: options.file_name.unwrap_or_default(),
            schema_path: options.schema_path,
        };
        workspace.cache_slot.enabled = options.enable_cache.unwrap_or(true);
        workspace.source_of_truth = options.source_of_truth.unwrap_or(
            if workspace.local_file.enabled {
                SourceOfTruth::Local
            } else if workspace.remote_repo.enabled {
                SourceOfTruth::Remote
            } else {
                SourceOfTruth::Cache
            },
        );
        workspace.normalize();
        workspace
    }

    /// Merge a partial update, then renormalize.
    pub fn apply(&mut self, update: WorkspaceUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(enabled) = update.enable_local {
            self.local_file.enabled = enabled;
        }
        if let Some(path) = update.local_path {
            if self.local_file.path.as_deref() != Some(path.as_str()) {
                self.local_file.handle_status = HandleStatus::Unlinked;
            }
            self.local_file.path = Some(path);
        }
        if let Some(enabled) = update.enable_remote {
            self.remote_repo.enabled = enabled;
        }
        if let Some(repo) = update.linked_repo {
            self.remote_repo.linked_repo = Some(repo);
        }
        if let Some(folder) = update.folder {
            self.remote_repo.folder = Some(folder);
        }
        if let Some(file_name) = update.file_name {
            self.remote_repo.file_name = file_name;
        }
        if let Some(schema_path) = update.schema_path {
            self.remote_repo.schema_path = Some(schema_path);
        }
        if let Some(enabled) = update.enable_cache {
            self.cache_slot.enabled = enabled;
        }
        if let Some(sot) = update.source_of_truth {
            self.source_of_truth = sot;
        }
        self.normalize();
    }

    pub fn normalize(&mut self) {
        if self.remote_repo.enabled && self.remote_repo.linked_repo.is_none() {
            tracing::warn!(slug = %self.slug, "remote tier enabled without a linked repository; disabling");
            self.remote_repo.enabled = false;
        }
        if self.local_file.enabled && self.local_file.path.is_none() {
            tracing::warn!(slug = %self.slug, "local tier enabled without a file path; disabling");
            self.local_file.enabled = false;
        }
        if self.enabled_tiers().is_empty() {
            tracing::debug!(slug = %self.slug, "no tier enabled; enabling cache");
            self.cache_slot.enabled = true;
        }

        if self.cache_slot.key.is_empty() {
            self.cache_slot.key = format!("workspace-{}", self.slug);
        }
        let folder = match self.remote_repo.folder.take() {
            Some(folder) => folder.trim_matches('/').to_string(),
            None => format!("universes/{}", self.slug),
        };
        self.remote_repo.folder = Some(folder);
        if self.remote_repo.file_name.is_empty() {
            self.remote_repo.file_name = format!("{}.{}", self.slug, FILE_EXTENSION);
        }

        if !self.tier_enabled(self.source_of_truth.tier()) {
            let fallback = self.enabled_tiers().first().copied().unwrap_or(Tier::Cache);
            tracing::debug!(
                slug = %self.slug,
                declared = %self.source_of_truth,
                fallback = %fallback,
                "source of truth not enabled; falling back"
            );
            self.source_of_truth = SourceOfTruth::from_tier(fallback);
        }
    }

    pub fn tier_enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Local => self.local_file.enabled,
            Tier::Remote => self.remote_repo.enabled,
            Tier::Cache => self.cache_slot.enabled,
        }
    }

    /// Enabled tiers in local → remote → cache order.
    pub fn enabled_tiers(&self) -> Vec<Tier> {
        Tier::PRIORITY
            .into_iter()
            .filter(|t| self.tier_enabled(*t))
            .collect()
    }

    /// Load order: the source of truth first, then the other enabled tiers.
    pub fn load_order(&self) -> Vec<Tier> {
        let first = self.source_of_truth.tier();
        let mut order = vec![first];
        order.extend(self.enabled_tiers().into_iter().filter(|t| *t != first));
        order
    }

    /// Primary document path in the linked repository.
    pub fn remote_path(&self) -> String {
        match self.remote_repo.folder.as_deref() {
            Some(folder) if !folder.is_empty() => {
                format!("{}/{}", folder, self.remote_repo.file_name)
            }
            _ => self.remote_repo.file_name.clone(),
        }
    }

    pub fn remote_target(&self) -> Option<RemoteTarget> {
        if !self.remote_repo.enabled {
            return None;
        }
        let repo = self.remote_repo.linked_repo.clone()?;
        Some(RemoteTarget::new(repo, self.remote_path()))
    }

    /// Document header for the next save.
    pub fn stamp(&self) -> DocumentStamp {
        DocumentStamp {
            title: self.name.clone(),
            created: self.metadata.created,
            modified: self.metadata.modified,
            content_hash: self.metadata.content_hash.clone(),
        }
    }

    /// Record a successful save.
    pub fn record_save(&mut self, stamp: &DocumentStamp, stats: ContentStats, now: DateTime<Utc>) {
        self.metadata.modified = stamp.modified;
        self.metadata.content_hash = stamp.content_hash.clone();
        self.metadata.stats = stats;
        self.metadata.last_saved = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn new_workspace_is_cache_only_with_defaults() {
        let ws = Workspace::new("alpha", "Alpha", now());
        assert_eq!(ws.enabled_tiers(), vec![Tier::Cache]);
        assert_eq!(ws.source_of_truth, SourceOfTruth::Cache);
        assert_eq!(ws.cache_slot.key, "workspace-alpha");
        assert_eq!(ws.remote_path(), "universes/alpha/alpha.redstring");
    }

    #[test]
    fn remote_without_repo_is_disabled_and_truth_falls_back() {
        let ws = Workspace::from_options(
            "beta",
            "Beta",
            WorkspaceOptions {
                source_of_truth: Some(SourceOfTruth::Remote),
                enable_remote: true,
                ..Default::default()
            },
            now(),
        );
        assert!(!ws.remote_repo.enabled);
        assert_eq!(ws.source_of_truth, SourceOfTruth::Cache);
    }

    #[test]
    fn cache_is_force_enabled_when_nothing_else_is() {
        let mut ws = Workspace::new("g", "G", now());
        ws.apply(WorkspaceUpdate {
            enable_cache: Some(false),
            ..Default::default()
        });
        assert!(ws.cache_slot.enabled);
    }

    #[test]
    fn truth_falls_back_in_priority_order() {
        let mut ws = Workspace::from_options(
            "d",
            "D",
            WorkspaceOptions {
                enable_local: true,
                local_path: Some("d.redstring".to_string()),
                enable_remote: true,
                linked_repo: Some(RepoRef::new("o", "r")),
                source_of_truth: Some(SourceOfTruth::Remote),
                ..Default::default()
            },
            now(),
        );
        assert_eq!(ws.load_order(), vec![Tier::Remote, Tier::Local, Tier::Cache]);

        ws.apply(WorkspaceUpdate {
            enable_remote: Some(false),
            ..Default::default()
        });
        assert_eq!(ws.source_of_truth, SourceOfTruth::Local);
        assert_eq!(ws.load_order(), vec![Tier::Local, Tier::Cache]);
        assert!(ws.remote_target().is_none());
    }

    #[test]
    fn folder_is_trimmed() {
        let ws = Workspace::from_options(
            "e",
            "E",
            WorkspaceOptions {
                enable_remote: true,
                linked_repo: Some(RepoRef::new("o", "r")),
                folder: Some("/universes/custom/".to_string()),
                file_name: Some("custom.redstring".to_string()),
                ..Default::default()
            },
            now(),
        );
        assert_eq!(ws.remote_path(), "universes/custom/custom.redstring");
        assert_eq!(ws.source_of_truth, SourceOfTruth::Remote);
    }

    #[test]
    fn empty_folder_means_repository_root() {
        let ws = Workspace::from_options(
            "notes",
            "Notes",
            WorkspaceOptions {
                enable_remote: true,
                linked_repo: Some(RepoRef::new("o", "r")),
                folder: Some(String::new()),
                file_name: Some("notes.redstring".to_string()),
                ..Default::default()
            },
            now(),
        );
        assert_eq!(ws.remote_repo.folder.as_deref(), Some(""));
        assert_eq!(ws.remote_path(), "notes.redstring");

        // Renormalizing keeps the root; only a missing folder gets the default.
        let mut renamed = ws.clone();
        renamed.apply(WorkspaceUpdate {
            name: Some("Renamed".to_string()),
            ..Default::default()
        });
        assert_eq!(renamed.remote_path(), "notes.redstring");
    }

    #[test]
    fn serializes_camel_case() {
        let ws = Workspace::new("alpha", "Alpha", now());
        let json = serde_json::to_value(&ws).unwrap();
        assert_eq!(json["sourceOfTruth"], "cache");
        assert_eq!(json["cacheSlot"]["key"], "workspace-alpha");
        assert_eq!(json["localFile"]["handleStatus"], "unlinked");
    }
}
