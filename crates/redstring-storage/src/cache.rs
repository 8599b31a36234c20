// cache.rs — Browser Cache Store: quota-aware snapshot persistence.
//
// The last-resort tier. Each workspace owns one key; the value is the
// serialized document. Every write is preceded by a quota check. When the
// check says there is not enough room, snapshots older than the three most
// recent (other than the one being written) are evicted and the write is
// attempted once more. If there is still no room the caller gets
// `StorageError::QuotaExceeded`; content is never truncated to fit.
//
// `CacheBackend` stands in for the browser's key-value store. Two backends:
// `MemoryCacheBackend` (tests, ephemeral sessions) and `DirCacheBackend`
// (one JSON file per key under a directory).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::StorageError;

/// Number of most-recent snapshots that eviction never touches.
pub const KEEP_RECENT: usize = 3;

/// One cached snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub content: String,
    pub saved_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Storage usage as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEstimate {
    pub usage: u64,
    pub quota: u64,
}

impl QuotaEstimate {
    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.usage)
    }
}

/// Key-value persistence with a storage quota.
pub trait CacheBackend: Send + Sync {
    fn estimate(&self) -> Result<QuotaEstimate, StorageError>;

    /// Insert or replace. Backends reject writes that would exceed the quota.
    fn put(&self, entry: CacheEntry) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> Result<bool, StorageError>;

    fn entries(&self) -> Result<Vec<CacheEntry>, StorageError>;
}

fn quota_check(
    estimate: QuotaEstimate,
    existing: u64,
    entry: &CacheEntry,
) -> Result<(), StorageError> {
    let available = estimate.available() + existing;
    if entry.size() > available {
        return Err(StorageError::QuotaExceeded {
            needed: entry.size(),
            available,
        });
    }
    Ok(())
}

// ── In-memory backend ────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryCacheBackend {
    entries: Mutex<BTreeMap<String, CacheEntry>>,
    quota: Mutex<u64>,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBackend {
    /// A backend with no practical quota.
    pub fn new() -> Self {
        Self::with_quota(u64::MAX)
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota: Mutex::new(quota),
        }
    }

    pub fn set_quota(&self, quota: u64) {
        *self.quota.lock().unwrap_or_else(|e| e.into_inner()) = quota;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn estimate(&self) -> Result<QuotaEstimate, StorageError> {
        let usage = self.lock().values().map(CacheEntry::size).sum();
        let quota = *self.quota.lock().unwrap_or_else(|e| e.into_inner());
        Ok(QuotaEstimate { usage, quota })
    }

    fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        let estimate = self.estimate()?;
        let mut entries = self.lock();
        let existing = entries.get(&entry.key).map(CacheEntry::size).unwrap_or(0);
        quota_check(estimate, existing, &entry)?;
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock().remove(key).is_some())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, StorageError> {
        Ok(self.lock().values().cloned().collect())
    }
}

// ── Directory backend ────────────────────────────────────────

/// One JSON file per key: `<dir>/<key>.json`.
#[derive(Debug)]
pub struct DirCacheBackend {
    dir: PathBuf,
    quota: u64,
}

impl DirCacheBackend {
    /// Create the backend, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>, quota: u64) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, quota })
    }

    fn entry_file(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    fn read_entry(path: &Path) -> Result<CacheEntry, StorageError> {
        let json = fs::read_to_string(path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl CacheBackend for DirCacheBackend {
    fn estimate(&self) -> Result<QuotaEstimate, StorageError> {
        let usage = self.entries()?.iter().map(CacheEntry::size).sum();
        Ok(QuotaEstimate {
            usage,
            quota: self.quota,
        })
    }

    fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        let existing = self.get(&entry.key)?.map(|e| e.size()).unwrap_or(0);
        quota_check(self.estimate()?, existing, &entry)?;

        let path = self.entry_file(&entry.key);
        let json = serde_json::to_string_pretty(&entry)?;
        fs::write(&path, json).map_err(|source| StorageError::Io { path, source })
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let path = self.entry_file(key);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_entry(&path).map(Some)
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.entry_file(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| StorageError::Io { path, source })?;
        Ok(true)
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, StorageError> {
        let read_dir = fs::read_dir(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(|source| StorageError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::read_entry(&path) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable cache entry")
                    }
                }
            }
        }
        Ok(entries)
    }
}

// ── Store ────────────────────────────────────────────────────

/// Quota-aware snapshot store over a [`CacheBackend`].
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: SharedClock) -> Self {
        Self { backend, clock }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    fn fits(&self, entry: &CacheEntry) -> Result<bool, StorageError> {
        let existing = self.backend.get(&entry.key)?.map(|e| e.size()).unwrap_or(0);
        Ok(quota_check(self.backend.estimate()?, existing, entry).is_ok())
    }

    /// Evict everything but the [`KEEP_RECENT`] newest snapshots, never
    /// touching `protect`. Returns the evicted keys, oldest first.
    pub fn evict_stale(&self, protect: &str) -> Result<Vec<String>, StorageError> {
        let mut others: Vec<CacheEntry> = self
            .backend
            .entries()?
            .into_iter()
            .filter(|e| e.key != protect)
            .collect();
        others.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));

        let mut evicted: Vec<String> = Vec::new();
        for entry in others.into_iter().skip(KEEP_RECENT).rev() {
            if self.backend.remove(&entry.key)? {
                evicted.push(entry.key);
            }
        }
        Ok(evicted)
    }

    /// Store `content` under `key`, evicting and retrying once if the quota
    /// check (or the write itself) reports insufficient space.
    pub fn save(&self, key: &str, content: &str) -> Result<(), StorageError> {
        let entry = CacheEntry {
            key: key.to_string(),
            content: content.to_string(),
            saved_at: self.clock.now(),
        };

        if self.fits(&entry)? {
            match self.backend.put(entry.clone()) {
                Err(e) if e.is_quota_exceeded() => {}
                other => return other,
            }
        }

        let evicted = self.evict_stale(key)?;
        tracing::warn!(
            key,
            needed = entry.size(),
            evicted = evicted.len(),
            "cache quota insufficient; evicted old snapshots"
        );

        if !self.fits(&entry)? {
            let estimate = self.backend.estimate()?;
            let existing = self.backend.get(key)?.map(|e| e.size()).unwrap_or(0);
            return Err(StorageError::QuotaExceeded {
                needed: entry.size(),
                available: estimate.available() + existing,
            });
        }
        self.backend.put(entry)
    }

    pub fn load(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.backend.get(key)
    }

    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.remove(key)
    }
}
