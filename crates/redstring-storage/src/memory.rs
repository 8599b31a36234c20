// memory.rs — In-memory Remote Storage Provider.
//
// Behaves like the hosting API as far as the rest of the system can tell:
// revision ids change on every write, stale revisions conflict, missing
// directories list as empty. It also records every call in an operation
// log and can be scripted to fail the next read or write, which is how the
// sync engine's conflict policy is exercised without a network.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::auth::AuthContext;
use crate::error::StorageError;
use crate::remote::{DirEntry, EntryKind, RemoteFile, RemoteProvider, RepoRef};

/// One call made against a [`MemoryProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOp {
    /// Full content read.
    ReadFile(String),
    /// Revision-id lookup (metadata only, no content).
    Revision(String),
    WriteFile(String),
    List(String),
}

impl ProviderOp {
    pub fn path(&self) -> &str {
        match self {
            ProviderOp::ReadFile(p)
            | ProviderOp::Revision(p)
            | ProviderOp::WriteFile(p)
            | ProviderOp::List(p) => p,
        }
    }
}

/// A failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Conflict,
    Auth,
    Network,
}

impl ScriptedFailure {
    fn into_error(self, path: &str) -> StorageError {
        match self {
            ScriptedFailure::Conflict => StorageError::Conflict {
                path: path.to_string(),
                expected: None,
            },
            ScriptedFailure::Auth => StorageError::Auth("scripted auth failure".to_string()),
            ScriptedFailure::Network => {
                StorageError::Network(format!("scripted network failure on {}", path))
            }
        }
    }
}

#[derive(Debug)]
struct StoredFile {
    content: String,
    revision: String,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<(String, String), StoredFile>,
    repos: BTreeSet<String>,
    next_revision: u64,
    ops: Vec<ProviderOp>,
    write_failures: VecDeque<ScriptedFailure>,
    read_failures: VecDeque<ScriptedFailure>,
    unavailable: bool,
}

impl State {
    fn bump_revision(&mut self) -> String {
        self.next_revision += 1;
        format!("rev-{}", self.next_revision)
    }
}

/// In-process remote provider with revision tracking and scripted failures.
#[derive(Debug)]
pub struct MemoryProvider {
    state: Mutex<State>,
    auth: AuthContext,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            auth: AuthContext::oauth("memory-token"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-call;
        // the map itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an (initially empty) repository.
    pub fn add_repo(&self, repo: &RepoRef) {
        self.lock().repos.insert(repo.to_string());
    }

    /// Seed a file directly (not recorded in the operation log).
    pub fn put_file(&self, repo: &RepoRef, path: &str, content: &str) -> String {
        let mut state = self.lock();
        let revision = state.bump_revision();
        state.repos.insert(repo.to_string());
        state.files.insert(
            (repo.to_string(), path.to_string()),
            StoredFile {
                content: content.to_string(),
                revision: revision.clone(),
            },
        );
        revision
    }

    /// Remove a file directly (not recorded).
    pub fn delete_file(&self, repo: &RepoRef, path: &str) -> bool {
        self.lock()
            .files
            .remove(&(repo.to_string(), path.to_string()))
            .is_some()
    }

    pub fn content(&self, repo: &RepoRef, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(repo.to_string(), path.to_string()))
            .map(|f| f.content.clone())
    }

    pub fn revision(&self, repo: &RepoRef, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(repo.to_string(), path.to_string()))
            .map(|f| f.revision.clone())
    }

    pub fn fail_next_write(&self, failure: ScriptedFailure) {
        self.lock().write_failures.push_back(failure);
    }

    pub fn fail_next_read(&self, failure: ScriptedFailure) {
        self.lock().read_failures.push_back(failure);
    }

    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Every recorded call, oldest first.
    pub fn ops(&self) -> Vec<ProviderOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Number of writes recorded against `path`.
    pub fn write_count(&self, path: &str) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, ProviderOp::WriteFile(p) if p == path))
            .count()
    }
}

#[async_trait]
impl RemoteProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn authenticate(&self) -> Result<AuthContext, StorageError> {
        Ok(self.auth.clone())
    }

    async fn is_available(&self) -> bool {
        !self.lock().unavailable
    }

    async fn repository_exists(&self, repo: &RepoRef) -> Result<bool, StorageError> {
        Ok(self.lock().repos.contains(&repo.to_string()))
    }

    async fn read_file(&self, repo: &RepoRef, path: &str) -> Result<RemoteFile, StorageError> {
        let mut state = self.lock();
        state.ops.push(ProviderOp::ReadFile(path.to_string()));
        if let Some(failure) = state.read_failures.pop_front() {
            return Err(failure.into_error(path));
        }
        state
            .files
            .get(&(repo.to_string(), path.to_string()))
            .map(|f| RemoteFile {
                path: path.to_string(),
                content: f.content.clone(),
                revision: f.revision.clone(),
            })
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn file_revision(&self, repo: &RepoRef, path: &str) -> Result<Option<String>, StorageError> {
        let mut state = self.lock();
        state.ops.push(ProviderOp::Revision(path.to_string()));
        Ok(state
            .files
            .get(&(repo.to_string(), path.to_string()))
            .map(|f| f.revision.clone()))
    }

    async fn write_file(
        &self,
        repo: &RepoRef,
        path: &str,
        content: &str,
        revision: Option<&str>,
    ) -> Result<String, StorageError> {
        let mut state = self.lock();
        state.ops.push(ProviderOp::WriteFile(path.to_string()));
        if let Some(failure) = state.write_failures.pop_front() {
            return Err(failure.into_error(path));
        }

        let key = (repo.to_string(), path.to_string());
        let current = state.files.get(&key).map(|f| f.revision.clone());
        if current.as_deref() != revision {
            return Err(StorageError::Conflict {
                path: path.to_string(),
                expected: revision.map(str::to_string),
            });
        }

        let new_revision = state.bump_revision();
        state.repos.insert(repo.to_string());
        state.files.insert(
            key,
            StoredFile {
                content: content.to_string(),
                revision: new_revision.clone(),
            },
        );
        Ok(new_revision)
    }

    async fn list_directory(&self, repo: &RepoRef, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let mut state = self.lock();
        state.ops.push(ProviderOp::List(path.to_string()));

        let dir = path.trim_matches('/');
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let repo_key = repo.to_string();

        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (file_repo, file_path) in state.files.keys() {
            if *file_repo != repo_key {
                continue;
            }
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child_dir, _)) => {
                    dirs.insert(child_dir.to_string());
                }
                None => entries.push(DirEntry {
                    name: rest.to_string(),
                    path: file_path.clone(),
                    kind: EntryKind::File,
                }),
            }
        }
        entries.extend(dirs.into_iter().map(|name| DirEntry {
            path: format!("{}{}", prefix, name),
            name,
            kind: EntryKind::Dir,
        }));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{export_all, import_all, write_with_latest_revision};

    fn repo() -> RepoRef {
        RepoRef::new("alice", "graphs")
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let provider = MemoryProvider::new();
        let rev1 = provider
            .write_file(&repo(), "a.redstring", "one", None)
            .await
            .unwrap();
        let rev2 = provider
            .write_file(&repo(), "a.redstring", "two", Some(&rev1))
            .await
            .unwrap();
        assert_ne!(rev1, rev2);

        let err = provider
            .write_file(&repo(), "a.redstring", "three", Some(&rev1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Creating over an existing file without a revision also conflicts.
        let err = provider
            .write_file(&repo(), "a.redstring", "four", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(provider.content(&repo(), "a.redstring").unwrap(), "two");
    }

    #[tokio::test]
    async fn missing_file_is_not_found_and_missing_dir_is_empty() {
        let provider = MemoryProvider::new();
        let err = provider.read_file(&repo(), "nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(provider
            .list_directory(&repo(), "nowhere")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_directory_reports_files_and_subdirs() {
        let provider = MemoryProvider::new();
        provider.put_file(&repo(), "universes/a/a.redstring", "{}");
        provider.put_file(&repo(), "universes/b/b.redstring", "{}");
        provider.put_file(&repo(), "universes/readme.md", "hi");

        let entries = provider.list_directory(&repo(), "universes").await.unwrap();
        let files: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.path.as_str())
            .collect();
        let dirs: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(files, vec!["universes/readme.md"]);
        assert_eq!(dirs, vec!["universes/a", "universes/b"]);
    }

    #[tokio::test]
    async fn scripted_write_failure_fires_once() {
        let provider = MemoryProvider::new();
        provider.fail_next_write(ScriptedFailure::Conflict);

        let first = write_with_latest_revision(&provider, &repo(), "f", "x").await;
        assert!(first.unwrap_err().is_conflict());
        let second = write_with_latest_revision(&provider, &repo(), "f", "x").await;
        assert!(second.is_ok());
        assert_eq!(provider.write_count("f"), 2);
    }

    #[tokio::test]
    async fn export_then_import_into_other_repo() {
        let provider = MemoryProvider::new();
        provider.put_file(&repo(), "universes/a/a.redstring", "A");
        provider.put_file(&repo(), "universes/b/deep/b.redstring", "B");

        let exported = export_all(&provider, &repo(), "universes").await.unwrap();
        assert_eq!(exported.len(), 2);

        let target = RepoRef::new("bob", "mirror");
        let pairs: Vec<(String, String)> = exported
            .into_iter()
            .map(|f| (f.path, f.content))
            .collect();
        assert_eq!(import_all(&provider, &target, &pairs).await.unwrap(), 2);
        assert_eq!(
            provider.content(&target, "universes/b/deep/b.redstring").unwrap(),
            "B"
        );

        // Re-import updates in place instead of conflicting.
        assert_eq!(import_all(&provider, &target, &pairs).await.unwrap(), 2);
    }
}
