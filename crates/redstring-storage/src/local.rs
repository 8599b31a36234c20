// local.rs — Local File Persistence.
//
// The user grants access to one file per workspace. In a browser that grant
// is a revocable capability; here it is modelled by the `FileHandle` trait
// with a filesystem implementation and an in-memory double whose permission
// can be revoked mid-test.
//
// `LocalFileTier` checks permission before every read and write and asks
// again if it is not granted. A denial flips the tier to `NeedsReconnect`;
// from then on it refuses work until the registry relinks it.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result of a permission query on a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    /// Not granted yet; asking may succeed.
    Prompt,
    Denied,
}

/// Connection state of a workspace's local file, persisted in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Connected,
    NeedsReconnect,
    #[default]
    Unlinked,
}

impl fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleStatus::Connected => write!(f, "connected"),
            HandleStatus::NeedsReconnect => write!(f, "needs_reconnect"),
            HandleStatus::Unlinked => write!(f, "unlinked"),
        }
    }
}

/// A user-granted capability to read and write one file.
#[async_trait]
pub trait FileHandle: Send + Sync + fmt::Debug {
    /// Stable identifier, persisted so the handle can be restored.
    fn path(&self) -> &str;

    async fn query_permission(&self) -> PermissionState;

    /// Ask for read/write access. May prompt the user.
    async fn request_permission(&self) -> PermissionState;

    async fn read(&self) -> Result<String, StorageError>;

    async fn write(&self, content: &str) -> Result<(), StorageError>;

    /// Cheap liveness check used when restoring a handle at startup.
    async fn check_alive(&self) -> Result<(), StorageError>;
}

/// Re-opens handles from persisted paths.
pub trait FileHandleFactory: Send + Sync {
    fn open(&self, path: &str) -> Arc<dyn FileHandle>;
}

// ── Filesystem ───────────────────────────────────────────────

/// A handle onto a real file.
///
/// Permission is granted when the parent directory exists; requesting
/// permission creates it. Writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FsFileHandle {
    path: PathBuf,
    display: String,
}

impl FsFileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display = path.display().to_string();
        Self { path, display }
    }

    fn parent(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        match source.kind() {
            ErrorKind::NotFound => StorageError::NotFound {
                path: self.display.clone(),
            },
            ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path: self.display.clone(),
            },
            _ => StorageError::Io {
                path: self.path.clone(),
                source,
            },
        }
    }
}

#[async_trait]
impl FileHandle for FsFileHandle {
    fn path(&self) -> &str {
        &self.display
    }

    async fn query_permission(&self) -> PermissionState {
        let Some(parent) = self.parent() else {
            return PermissionState::Granted;
        };
        match tokio::fs::metadata(parent).await {
            Ok(meta) if meta.permissions().readonly() => PermissionState::Denied,
            Ok(_) => PermissionState::Granted,
            Err(e) if e.kind() == ErrorKind::NotFound => PermissionState::Prompt,
            Err(_) => PermissionState::Denied,
        }
    }

    async fn request_permission(&self) -> PermissionState {
        if let Some(parent) = self.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(path = %self.display, error = %e, "cannot create parent directory");
                return PermissionState::Denied;
            }
        }
        self.query_permission().await
    }

    async fn read(&self) -> Result<String, StorageError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    async fn write(&self, content: &str) -> Result<(), StorageError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    async fn check_alive(&self) -> Result<(), StorageError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => Ok(()),
            // Not written yet: the handle is live if its directory is.
            Err(e) if e.kind() == ErrorKind::NotFound => match self.query_permission().await {
                PermissionState::Granted => Ok(()),
                _ => Err(self.io_error(e)),
            },
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// Opens [`FsFileHandle`]s, resolving relative paths against a root.
#[derive(Debug, Clone)]
pub struct FsHandleFactory {
    root: PathBuf,
}

impl FsHandleFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileHandleFactory for FsHandleFactory {
    fn open(&self, path: &str) -> Arc<dyn FileHandle> {
        let p = Path::new(path);
        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        };
        Arc::new(FsFileHandle::new(full))
    }
}

// ── In-memory ────────────────────────────────────────────────

#[derive(Debug)]
struct MemoryHandleState {
    content: Option<String>,
    permission: PermissionState,
    grant_on_request: bool,
    writes: usize,
}

/// An in-memory file whose permission can be revoked.
#[derive(Debug)]
pub struct MemoryFileHandle {
    path: String,
    state: Mutex<MemoryHandleState>,
}

impl MemoryFileHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(MemoryHandleState {
                content: None,
                permission: PermissionState::Granted,
                grant_on_request: true,
                writes: 0,
            }),
        }
    }

    pub fn with_content(path: impl Into<String>, content: impl Into<String>) -> Self {
        let handle = Self::new(path);
        handle.lock().content = Some(content.into());
        handle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryHandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Revoke access; later requests are denied too.
    pub fn revoke(&self) {
        let mut state = self.lock();
        state.permission = PermissionState::Denied;
        state.grant_on_request = false;
    }

    /// Drop the grant but let the next request succeed (a browser reload).
    pub fn reset_to_prompt(&self) {
        let mut state = self.lock();
        state.permission = PermissionState::Prompt;
        state.grant_on_request = true;
    }

    pub fn grant(&self) {
        let mut state = self.lock();
        state.permission = PermissionState::Granted;
        state.grant_on_request = true;
    }

    pub fn content(&self) -> Option<String> {
        self.lock().content.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.lock().permission == PermissionState::Granted {
            Ok(())
        } else {
            Err(StorageError::PermissionDenied {
                path: self.path.clone(),
            })
        }
    }
}

#[async_trait]
impl FileHandle for MemoryFileHandle {
    fn path(&self) -> &str {
        &self.path
    }

    async fn query_permission(&self) -> PermissionState {
        self.lock().permission
    }

    async fn request_permission(&self) -> PermissionState {
        let mut state = self.lock();
        if state.grant_on_request {
            state.permission = PermissionState::Granted;
        } else {
            state.permission = PermissionState::Denied;
        }
        state.permission
    }

    async fn read(&self) -> Result<String, StorageError> {
        self.check()?;
        self.lock()
            .content
            .clone()
            .ok_or_else(|| StorageError::NotFound {
                path: self.path.clone(),
            })
    }

    async fn write(&self, content: &str) -> Result<(), StorageError> {
        self.check()?;
        let mut state = self.lock();
        state.content = Some(content.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn check_alive(&self) -> Result<(), StorageError> {
        if self.lock().permission == PermissionState::Denied {
            return Err(StorageError::PermissionDenied {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

/// Hands out one shared [`MemoryFileHandle`] per path.
#[derive(Debug, Default)]
pub struct MemoryHandleFactory {
    handles: Mutex<HashMap<String, Arc<MemoryFileHandle>>>,
}

impl MemoryHandleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle for `path`, created on first use.
    pub fn handle(&self, path: &str) -> Arc<MemoryFileHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(MemoryFileHandle::new(path)))
            .clone()
    }
}

impl FileHandleFactory for MemoryHandleFactory {
    fn open(&self, path: &str) -> Arc<dyn FileHandle> {
        self.handle(path)
    }
}

// ── Tier ─────────────────────────────────────────────────────

/// The local-file tier of one workspace.
#[derive(Debug)]
pub struct LocalFileTier {
    handle: Arc<dyn FileHandle>,
    status: Mutex<HandleStatus>,
}

impl LocalFileTier {
    /// Wrap a freshly granted handle.
    pub fn new(handle: Arc<dyn FileHandle>) -> Self {
        Self {
            handle,
            status: Mutex::new(HandleStatus::Connected),
        }
    }

    /// Restore a handle from persisted metadata. A failed liveness check
    /// yields a tier in `NeedsReconnect` rather than an error.
    pub async fn restore(handle: Arc<dyn FileHandle>) -> Self {
        let status = match handle.check_alive().await {
            Ok(()) => HandleStatus::Connected,
            Err(e) => {
                tracing::warn!(path = handle.path(), error = %e, "local file handle failed liveness check");
                HandleStatus::NeedsReconnect
            }
        };
        Self {
            handle,
            status: Mutex::new(status),
        }
    }

    pub fn path(&self) -> &str {
        self.handle.path()
    }

    pub fn status(&self) -> HandleStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn needs_reconnect(&self) -> bool {
        self.status() == HandleStatus::NeedsReconnect
    }

    fn set_status(&self, status: HandleStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn denied(&self) -> StorageError {
        StorageError::PermissionDenied {
            path: self.handle.path().to_string(),
        }
    }

    async fn ensure_permission(&self) -> Result<(), StorageError> {
        if self.needs_reconnect() {
            return Err(self.denied());
        }
        if self.handle.query_permission().await == PermissionState::Granted {
            return Ok(());
        }
        tracing::debug!(path = self.path(), "local permission not granted; requesting");
        if self.handle.request_permission().await == PermissionState::Granted {
            return Ok(());
        }
        tracing::warn!(path = self.path(), "local file permission denied; tier needs reconnect");
        self.set_status(HandleStatus::NeedsReconnect);
        Err(self.denied())
    }

    fn observe<T>(&self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(e) = &result {
            if e.is_permission_denied() {
                tracing::warn!(path = self.path(), "local file access revoked; tier needs reconnect");
                self.set_status(HandleStatus::NeedsReconnect);
            }
        }
        result
    }

    pub async fn save(&self, content: &str) -> Result<(), StorageError> {
        self.ensure_permission().await?;
        let result = self.handle.write(content).await;
        self.observe(result)
    }

    pub async fn load(&self) -> Result<String, StorageError> {
        self.ensure_permission().await?;
        let result = self.handle.read().await;
        self.observe(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_handle_marks_needs_reconnect() {
        let handle = Arc::new(MemoryFileHandle::new("alpha.redstring"));
        let tier = LocalFileTier::new(handle.clone());

        tier.save("one").await.unwrap();
        assert_eq!(tier.status(), HandleStatus::Connected);

        handle.revoke();
        let err = tier.save("two").await.unwrap_err();
        assert!(err.is_permission_denied());
        assert!(tier.needs_reconnect());
        assert_eq!(handle.content().as_deref(), Some("one"));

        // Excluded until relinked, even if access comes back.
        handle.grant();
        assert!(tier.save("three").await.is_err());
        assert_eq!(handle.write_count(), 1);
    }

    #[tokio::test]
    async fn prompt_state_is_re_requested() {
        let handle = Arc::new(MemoryFileHandle::with_content("b.redstring", "{}"));
        handle.reset_to_prompt();
        let tier = LocalFileTier::new(handle.clone());
        assert_eq!(tier.load().await.unwrap(), "{}");
        assert_eq!(tier.status(), HandleStatus::Connected);
    }

    #[tokio::test]
    async fn restore_with_dead_handle_does_not_fail() {
        let handle = Arc::new(MemoryFileHandle::new("gone.redstring"));
        handle.revoke();
        let tier = LocalFileTier::restore(handle).await;
        assert_eq!(tier.status(), HandleStatus::NeedsReconnect);
    }

    #[tokio::test]
    async fn fs_handle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FsHandleFactory::new(dir.path());
        let handle = factory.open("nested/w.redstring");

        assert_eq!(handle.query_permission().await, PermissionState::Prompt);
        let tier = LocalFileTier::new(handle);
        tier.save("{\"a\":1}").await.unwrap();
        assert_eq!(tier.load().await.unwrap(), "{\"a\":1}");
        assert!(dir.path().join("nested/w.redstring").exists());
        assert!(!dir.path().join("nested/w.redstring.tmp").exists());
    }

    #[tokio::test]
    async fn fs_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tier = LocalFileTier::new(Arc::new(FsFileHandle::new(dir.path().join("x.redstring"))));
        assert!(tier.load().await.unwrap_err().is_not_found());
        assert_eq!(tier.status(), HandleStatus::Connected);
    }

    #[test]
    fn handle_status_serializes_snake_case() {
        let json = serde_json::to_string(&HandleStatus::NeedsReconnect).unwrap();
        assert_eq!(json, "\"needs_reconnect\"");
    }
}
