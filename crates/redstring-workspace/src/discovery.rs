// discovery.rs — Find existing workspace files in a remote repository.
//
// Walks a constrained root (default `universes/`) depth-first, skipping
// hidden and backup-named directories. Every `.redstring` file is a
// candidate: it is read, parsed under any accepted schema shape, and kept
// only if it carries at least one node, edge or graph. Unreadable, empty
// or malformed candidates are counted and skipped; they never abort the
// scan.
//
// Naming: the in-file title wins unless it is empty or a placeholder
// ("untitled", "add", ...). Otherwise the containing folder's name is used,
// or the file stem if the folder itself is generic ("default", "universe").

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use redstring_document::{ContentStats, SchemaShape, WorkspaceDocument, BACKUP_SUFFIX, FILE_EXTENSION};
use redstring_storage::{EntryKind, RemoteProvider, RepoRef};

use crate::error::WorkspaceError;
use crate::slug::{slugify, unique_slug};

/// Titles that say nothing about the workspace.
const PLACEHOLDER_TITLES: &[&str] = &[
    "untitled",
    "untitled space",
    "untitled universe",
    "untitled workspace",
    "add",
    "new",
    "new universe",
    "new space",
    "new workspace",
];

/// Folder names too generic to name a workspace after.
const GENERIC_FOLDERS: &[&str] = &[
    "",
    "default",
    "universe",
    "universes",
    "workspace",
    "workspaces",
    "space",
    "spaces",
];

/// A workspace file found in a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredWorkspace {
    /// Path of the document from the repository root.
    pub path: String,
    pub folder: String,
    pub file_name: String,
    pub slug: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub stats: ContentStats,
    pub has_content: bool,
    pub valid: bool,
    pub shape: SchemaShape,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub directories_scanned: usize,
    pub candidates: usize,
    pub valid: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub workspaces: Vec<DiscoveredWorkspace>,
    pub stats: DiscoveryStats,
}

pub struct DiscoveryService {
    provider: Arc<dyn RemoteProvider>,
    root: String,
    max_depth: usize,
}

impl DiscoveryService {
    pub fn new(provider: Arc<dyn RemoteProvider>, root: impl Into<String>, max_depth: usize) -> Self {
        Self {
            provider,
            root: root.into().trim_matches('/').to_string(),
            max_depth,
        }
    }

    pub async fn scan(&self, repo: &RepoRef) -> Result<DiscoveryReport, WorkspaceError> {
        let mut report = DiscoveryReport::default();
        let mut slugs: HashSet<String> = HashSet::new();
        let mut pending = vec![(self.root.clone(), 0usize)];

        while let Some((dir, depth)) = pending.pop() {
            let entries = self.provider.list_directory(repo, &dir).await?;
            report.stats.directories_scanned += 1;

            for entry in entries {
                match entry.kind {
                    EntryKind::Dir => {
                        if is_skipped_dir(&entry.name) {
                            tracing::debug!(path = %entry.path, "discovery skipping directory");
                        } else if depth + 1 > self.max_depth {
                            tracing::debug!(path = %entry.path, depth, "discovery depth limit reached");
                        } else {
                            pending.push((entry.path, depth + 1));
                        }
                    }
                    EntryKind::File if is_candidate(&entry.name) => {
                        report.stats.candidates += 1;
                        match self.inspect(repo, &entry.path).await {
                            Some(mut found) => {
                                found.slug = unique_slug(&found.slug, |s| slugs.contains(s));
                                slugs.insert(found.slug.clone());
                                report.stats.valid += 1;
                                report.workspaces.push(found);
                            }
                            None => report.stats.invalid += 1,
                        }
                    }
                    EntryKind::File => {}
                }
            }
        }

        report.workspaces.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!(
            repo = %repo,
            root = %self.root,
            directories = report.stats.directories_scanned,
            candidates = report.stats.candidates,
            valid = report.stats.valid,
            invalid = report.stats.invalid,
            "discovery scan complete"
        );
        Ok(report)
    }

    /// Read and validate one candidate. `None` means skip it.
    async fn inspect(&self, repo: &RepoRef, path: &str) -> Option<DiscoveredWorkspace> {
        let file = match self.provider.read_file(repo, path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path, error = %e, "discovery could not read candidate");
                return None;
            }
        };
        let doc = match WorkspaceDocument::parse(&file.content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!(path, error = %e, "discovery skipping unparsable candidate");
                return None;
            }
        };
        let stats = doc.stats();
        if !stats.has_content() {
            tracing::debug!(path, "discovery skipping empty candidate");
            return None;
        }

        let (folder, file_name) = match path.rsplit_once('/') {
            Some((folder, file_name)) => (folder.to_string(), file_name.to_string()),
            None => (String::new(), path.to_string()),
        };
        let title = doc.title().map(str::to_string);
        let name = derive_name(title.as_deref(), &folder, &file_name);
        Some(DiscoveredWorkspace {
            path: path.to_string(),
            slug: slugify(&name),
            name,
            folder,
            file_name,
            title,
            stats,
            has_content: true,
            valid: true,
            shape: doc.shape,
        })
    }
}

fn is_backup_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(BACKUP_SUFFIX) || lower == "backup" || lower == "backups" || lower.ends_with("-backup")
}

fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.') || is_backup_name(name)
}

fn is_candidate(name: &str) -> bool {
    !name.starts_with('.')
        && !is_backup_name(name)
        && name
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(FILE_EXTENSION))
}

fn is_placeholder(title: &str) -> bool {
    let lower = title.trim().to_ascii_lowercase();
    lower.is_empty() || PLACEHOLDER_TITLES.contains(&lower.as_str())
}

/// Title, else folder name, else file stem.
pub fn derive_name(title: Option<&str>, folder: &str, file_name: &str) -> String {
    if let Some(title) = title.filter(|t| !is_placeholder(t)) {
        return title.trim().to_string();
    }
    let folder_name = folder.rsplit('/').next().unwrap_or_default();
    if !GENERIC_FOLDERS.contains(&folder_name.to_ascii_lowercase().as_str()) {
        return folder_name.to_string();
    }
    file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_string()
}
