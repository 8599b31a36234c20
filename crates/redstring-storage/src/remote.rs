// remote.rs — The Remote Storage Provider abstraction.
//
// A thin, file-oriented view of a Git-hosting contents API: read a file,
// create-or-update a file against its current revision id, list a
// directory. Updates must name the revision they replace so two writers
// never silently clobber each other; a stale revision yields
// `StorageError::Conflict`.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::AuthContext;
use crate::error::StorageError;

/// A repository on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `"owner/name"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (owner, name) = s.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A file read from the remote, with the revision id needed to update it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub path: String,
    pub content: String,
    pub revision: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// Full path from the repository root.
    pub path: String,
    pub kind: EntryKind,
}

/// Pluggable client for the remote tier.
///
/// Every path is relative to the repository root and uses `/` separators.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Provider display name (for logs).
    fn name(&self) -> &str;

    /// Resolve (and if needed refresh) the credential used for requests.
    async fn authenticate(&self) -> Result<AuthContext, StorageError>;

    /// Network + auth check. Implementations retry a bounded number of times
    /// before reporting `false`; this never returns an error.
    async fn is_available(&self) -> bool;

    /// Whether the repository exists and is visible with the current credential.
    async fn repository_exists(&self, repo: &RepoRef) -> Result<bool, StorageError>;

    /// Read a file. A missing file is `StorageError::NotFound`.
    async fn read_file(&self, repo: &RepoRef, path: &str) -> Result<RemoteFile, StorageError>;

    /// Current revision id of a file, `None` if it does not exist.
    async fn file_revision(&self, repo: &RepoRef, path: &str) -> Result<Option<String>, StorageError>;

    /// Create (`revision = None`) or update (`revision = Some(current)`) a
    /// file. Returns the new revision id.
    async fn write_file(
        &self,
        repo: &RepoRef,
        path: &str,
        content: &str,
        revision: Option<&str>,
    ) -> Result<String, StorageError>;

    /// List a directory. A missing directory is an empty listing.
    async fn list_directory(&self, repo: &RepoRef, path: &str) -> Result<Vec<DirEntry>, StorageError>;
}

/// Write `content`, fetching the file's latest revision id immediately before
/// the write. This narrows the window in which a concurrent writer can slip
/// in between our read of the revision and our update.
pub async fn write_with_latest_revision(
    provider: &dyn RemoteProvider,
    repo: &RepoRef,
    path: &str,
    content: &str,
) -> Result<String, StorageError> {
    let revision = provider.file_revision(repo, path).await?;
    provider
        .write_file(repo, path, content, revision.as_deref())
        .await
}

/// Bulk export: every file under `prefix`, depth-first.
pub async fn export_all(
    provider: &dyn RemoteProvider,
    repo: &RepoRef,
    prefix: &str,
) -> Result<Vec<RemoteFile>, StorageError> {
    let mut files = Vec::new();
    let mut pending = vec![prefix.trim_matches('/').to_string()];

    while let Some(dir) = pending.pop() {
        for entry in provider.list_directory(repo, &dir).await? {
            match entry.kind {
                EntryKind::Dir => pending.push(entry.path),
                EntryKind::File => match provider.read_file(repo, &entry.path).await {
                    Ok(file) => files.push(file),
                    // Deleted between listing and read.
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::info!(repo = %repo, prefix, count = files.len(), "exported remote files");
    Ok(files)
}

/// Bulk import: create-or-update each `(path, content)` pair. Returns the
/// number of files written.
pub async fn import_all(
    provider: &dyn RemoteProvider,
    repo: &RepoRef,
    files: &[(String, String)],
) -> Result<usize, StorageError> {
    for (path, content) in files {
        write_with_latest_revision(provider, repo, path, content).await?;
    }
    tracing::info!(repo = %repo, count = files.len(), "imported remote files");
    Ok(files.len())
}
