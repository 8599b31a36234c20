// events.rs — Status events and their dispatch.
//
// Background work (scheduled commits, conflict handling, tier degradation)
// has no caller waiting on it, so its outcome is pushed as a `StatusEvent`.
// The registry emits workspace-level events through the same dispatcher.
//
// Wire shape is `{ "type": "<snake_case>", "status": { ...fields } }`,
// matching the bridge's status-push messages.
//
// Sinks:
//   TracingSink  — logs every event at an appropriate level
//   ChannelSink  — fans events out over a tokio broadcast channel
//   MemorySink   — collects events for assertions in tests

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use redstring_storage::Tier;

use crate::error::SyncError;

/// How a write conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Remote is the source of truth: local change discarded, remote reloaded.
    RemoteWins,
    /// The write was retried once and succeeded.
    Retried,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "status", rename_all = "snake_case")]
pub enum StatusEvent {
    SyncStarted {
        slug: String,
    },
    SyncStopped {
        slug: String,
    },
    CommitSucceeded {
        slug: String,
        revision: String,
        at: DateTime<Utc>,
    },
    CommitFailed {
        slug: String,
        error: String,
        consecutive_errors: u32,
    },
    ConflictResolved {
        slug: String,
        resolution: ConflictResolution,
    },
    RemoteReloaded {
        slug: String,
    },
    /// The credential was rejected even after a refresh.
    AuthRequired {
        slug: String,
        message: String,
    },
    /// Pending changes were dropped because the queue was full.
    PendingDropped {
        slug: String,
        dropped: u64,
    },
    /// One tier failed during a multi-tier save or load.
    TierDegraded {
        slug: String,
        tier: Tier,
        error: String,
    },
    TierNeedsReconnect {
        slug: String,
        path: String,
    },
    WorkspaceSwitched {
        from: Option<String>,
        to: String,
    },
    RegistryReady,
    RegistryFailed {
        error: String,
    },
}

impl StatusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StatusEvent::SyncStarted { .. } => "sync_started",
            StatusEvent::SyncStopped { .. } => "sync_stopped",
            StatusEvent::CommitSucceeded { .. } => "commit_succeeded",
            StatusEvent::CommitFailed { .. } => "commit_failed",
            StatusEvent::ConflictResolved { .. } => "conflict_resolved",
            StatusEvent::RemoteReloaded { .. } => "remote_reloaded",
            StatusEvent::AuthRequired { .. } => "auth_required",
            StatusEvent::PendingDropped { .. } => "pending_dropped",
            StatusEvent::TierDegraded { .. } => "tier_degraded",
            StatusEvent::TierNeedsReconnect { .. } => "tier_needs_reconnect",
            StatusEvent::WorkspaceSwitched { .. } => "workspace_switched",
            StatusEvent::RegistryReady => "registry_ready",
            StatusEvent::RegistryFailed { .. } => "registry_failed",
        }
    }

    /// The workspace this event concerns, if any.
    pub fn slug(&self) -> Option<&str> {
        match self {
            StatusEvent::SyncStarted { slug }
            | StatusEvent::SyncStopped { slug }
            | StatusEvent::CommitSucceeded { slug, .. }
            | StatusEvent::CommitFailed { slug, .. }
            | StatusEvent::ConflictResolved { slug, .. }
            | StatusEvent::RemoteReloaded { slug }
            | StatusEvent::AuthRequired { slug, .. }
            | StatusEvent::PendingDropped { slug, .. }
            | StatusEvent::TierDegraded { slug, .. }
            | StatusEvent::TierNeedsReconnect { slug, .. } => Some(slug),
            StatusEvent::WorkspaceSwitched { to, .. } => Some(to),
            StatusEvent::RegistryReady | StatusEvent::RegistryFailed { .. } => None,
        }
    }
}

/// Receives status events. Errors are logged by the dispatcher and never
/// stop delivery to other sinks.
pub trait StatusSink: Send + Sync {
    fn send(&self, event: &StatusEvent) -> Result<(), SyncError>;
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn send(&self, event: &StatusEvent) -> Result<(), SyncError> {
        let kind = event.event_type();
        let slug = event.slug().unwrap_or("-");
        match event {
            StatusEvent::CommitFailed { error, .. }
            | StatusEvent::TierDegraded { error, .. }
            | StatusEvent::RegistryFailed { error } => {
                tracing::warn!(event = kind, slug, error = %error, "status")
            }
            StatusEvent::AuthRequired { message, .. } => {
                tracing::warn!(event = kind, slug, message = %message, "status")
            }
            StatusEvent::TierNeedsReconnect { path, .. } => {
                tracing::warn!(event = kind, slug, path = %path, "status")
            }
            _ => tracing::debug!(event = kind, slug, "status"),
        }
        Ok(())
    }
}

/// Broadcasts events to any number of async subscribers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<StatusEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl StatusSink for ChannelSink {
    fn send(&self, event: &StatusEvent) -> Result<(), SyncError> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Event type names, in arrival order.
    pub fn types(&self) -> Vec<&'static str> {
        self.events().iter().map(StatusEvent::event_type).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl StatusSink for MemorySink {
    fn send(&self, event: &StatusEvent) -> Result<(), SyncError> {
        self.events
            .lock()
            .map_err(|_| SyncError::Sink("memory sink poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// Dispatches events to every registered sink.
///
/// Shared behind an `Arc` by the registry and every sync engine, so sinks
/// can be added after construction.
#[derive(Default)]
pub struct EventDispatcher {
    sinks: RwLock<Vec<Box<dyn StatusSink>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with a [`TracingSink`] already attached.
    pub fn with_tracing() -> Arc<Self> {
        let dispatcher = Self::new();
        dispatcher.add_sink(Box::new(TracingSink));
        Arc::new(dispatcher)
    }

    pub fn add_sink(&self, sink: Box<dyn StatusSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn dispatch(&self, event: StatusEvent) {
        let Ok(sinks) = self.sinks.read() else {
            tracing::warn!(event = event.event_type(), "status dispatcher poisoned; event dropped");
            return;
        };
        for sink in sinks.iter() {
            if let Err(e) = sink.send(&event) {
                tracing::warn!("status sink error: {}", e);
            }
        }
    }
}
