// config.rs — Sync engine configuration (the `[sync]` table of redstring.toml).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How often the background timer checks for pending changes.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Minimum time between two commit attempts (debounce).
    #[serde(default = "default_min_commit_interval_ms")]
    pub min_commit_interval_ms: u64,

    /// Wait before the single retry after a conflict when the remote is not
    /// the source of truth.
    #[serde(default = "default_conflict_retry_delay_ms")]
    pub conflict_retry_delay_ms: u64,

    /// Pending-change queue bound; the oldest changes are dropped beyond it.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Consecutive commit failures before ticks start backing off.
    #[serde(default = "default_error_backoff_threshold")]
    pub error_backoff_threshold: u32,

    /// Suffix of the shadow backup written next to the primary file.
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            min_commit_interval_ms: default_min_commit_interval_ms(),
            conflict_retry_delay_ms: default_conflict_retry_delay_ms(),
            max_pending: default_max_pending(),
            error_backoff_threshold: default_error_backoff_threshold(),
            backup_suffix: default_backup_suffix(),
        }
    }
}

impl SyncConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn min_commit_interval(&self) -> Duration {
        Duration::from_millis(self.min_commit_interval_ms)
    }

    pub fn conflict_retry_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_retry_delay_ms)
    }

    /// Path of the shadow backup for `path`.
    pub fn backup_path(&self, path: &str) -> String {
        format!("{}{}", path, self.backup_suffix)
    }
}

// Serde default functions
fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_min_commit_interval_ms() -> u64 {
    5_000
}

fn default_conflict_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_pending() -> usize {
    10
}

fn default_error_backoff_threshold() -> u32 {
    3
}

fn default_backup_suffix() -> String {
    redstring_document::BACKUP_SUFFIX.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.conflict_retry_delay(), Duration::from_secs(2));
        assert_eq!(config.max_pending, 10);
        assert_eq!(
            config.backup_path("universes/a/a.redstring"),
            "universes/a/a.redstring.backup"
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_pending": 3}"#).unwrap();
        assert_eq!(config.max_pending, 3);
        assert_eq!(config.min_commit_interval_ms, 5_000);
    }
}
