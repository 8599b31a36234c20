// engine.rs — The per-workspace Sync Engine.
//
// One engine per workspace with an enabled remote tier. The host pushes
// snapshots with `update_state` (never blocks); a periodic timer calls
// `tick`, which commits the newest pending snapshot once the debounce
// interval has elapsed. Each commit writes the primary document and then a
// shadow backup next to it.
//
// Conflict policy:
//   source of truth = remote → reload from remote, discard local pending
//   otherwise               → wait `conflict_retry_delay`, retry once
// A second conflict is reported as `CommitFailed`; nothing retries forever.
//
// Lifecycle: Stopped → Running (`start`) → Stopped (`stop`). Both are
// idempotent. `stop` never aborts an in-flight write; the timer task just
// does not schedule another tick. Commits (timer or forced) are serialized
// by `commit_lock`, and every write fetches the latest revision id right
// before it is sent.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use redstring_document::{DocumentStamp, GraphSnapshot, WorkspaceDocument};
use redstring_storage::clock::elapsed_between;
use redstring_storage::{
    write_with_latest_revision, RemoteProvider, RepoRef, SharedClock, SourceOfTruth, StorageError,
};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{ConflictResolution, EventDispatcher, StatusEvent};
use crate::queue::PendingQueue;

/// Where in the remote repository a workspace lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub repo: RepoRef,
    /// Primary document path from the repository root.
    pub path: String,
}

impl RemoteTarget {
    pub fn new(repo: RepoRef, path: impl Into<String>) -> Self {
        Self {
            repo,
            path: path.into(),
        }
    }
}

/// Snapshot of engine state for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub slug: String,
    pub running: bool,
    pub pending: usize,
    pub last_commit: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

/// Result of a commit that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { revision: String },
    /// A conflict with a remote source of truth; local changes were dropped
    /// and the remote state is available from [`SyncEngine::take_reloaded`].
    ReloadedFromRemote,
}

/// What a timer tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing pending.
    Idle,
    /// Pending changes, but the debounce interval has not elapsed.
    Debounced,
    /// Too many consecutive failures; waiting out the back-off.
    BackingOff,
    Committed(CommitOutcome),
}

#[derive(Debug)]
struct EngineState {
    running: bool,
    source_of_truth: SourceOfTruth,
    pending: PendingQueue,
    stamp: DocumentStamp,
    last_commit: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    consecutive_errors: u32,
    last_error: Option<String>,
    reloaded: Option<GraphSnapshot>,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    // Detached on stop so an in-flight commit runs to completion.
    _handle: JoinHandle<()>,
}

/// Construction parameters for a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncEngineOptions {
    pub slug: String,
    pub target: RemoteTarget,
    pub source_of_truth: SourceOfTruth,
    /// Document header carried across commits.
    pub stamp: DocumentStamp,
    pub config: SyncConfig,
}

pub struct SyncEngine {
    slug: String,
    target: RemoteTarget,
    config: SyncConfig,
    provider: Arc<dyn RemoteProvider>,
    clock: SharedClock,
    events: Arc<EventDispatcher>,
    state: Mutex<EngineState>,
    commit_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("slug", &self.slug)
            .field("target", &self.target)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        options: SyncEngineOptions,
        provider: Arc<dyn RemoteProvider>,
        clock: SharedClock,
        events: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        let state = EngineState {
            running: false,
            source_of_truth: options.source_of_truth,
            pending: PendingQueue::new(options.config.max_pending),
            stamp: options.stamp,
            last_commit: None,
            last_attempt: None,
            consecutive_errors: 0,
            last_error: None,
            reloaded: None,
        };
        Arc::new(Self {
            slug: options.slug,
            target: options.target,
            config: options.config,
            provider,
            clock,
            events,
            state: Mutex::new(state),
            commit_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub fn backup_path(&self) -> String {
        self.config.backup_path(&self.target.path)
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn source_of_truth(&self) -> SourceOfTruth {
        self.lock().source_of_truth
    }

    pub fn set_source_of_truth(&self, source_of_truth: SourceOfTruth) {
        self.lock().source_of_truth = source_of_truth;
    }

    /// The document header the next commit will carry.
    pub fn stamp(&self) -> DocumentStamp {
        self.lock().stamp.clone()
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.lock();
        SyncStatus {
            slug: self.slug.clone(),
            running: state.running,
            pending: state.pending.len(),
            last_commit: state.last_commit,
            consecutive_errors: state.consecutive_errors,
            last_error: state.last_error.clone(),
        }
    }

    /// Start the periodic commit timer. No-op if already running.
    ///
    /// The timer runs on tokio time while the debounce reads the injected
    /// clock; pair it with `TokioClock` to drive both from paused time.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);
        let period = self.config.tick_interval();
        let slug = self.slug.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if !engine.is_running() {
                    break;
                }
                // Failures are already reported as status events.
                if let Err(e) = engine.tick().await {
                    tracing::debug!(slug = %engine.slug, error = %e, "scheduled commit failed");
                }
            }
            tracing::debug!(slug = %slug, "sync timer exited");
        });

        *worker = Some(Worker {
            shutdown,
            _handle: handle,
        });
        self.lock().running = true;
        tracing::info!(slug = %self.slug, target = %self.target.path, "sync engine started");
        self.events.dispatch(StatusEvent::SyncStarted {
            slug: self.slug.clone(),
        });
    }

    /// Stop the timer. No-op if not running.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };
        let _ = worker.shutdown.send(true);
        self.lock().running = false;
        tracing::info!(slug = %self.slug, "sync engine stopped");
        self.events.dispatch(StatusEvent::SyncStopped {
            slug: self.slug.clone(),
        });
    }

    /// Queue a snapshot for the next commit. Never blocks on I/O.
    pub fn update_state(&self, snapshot: GraphSnapshot) {
        let now = self.clock.now();
        let dropped = self.lock().pending.push(snapshot, now, &self.slug);
        if dropped > 0 {
            self.events.dispatch(StatusEvent::PendingDropped {
                slug: self.slug.clone(),
                dropped,
            });
        }
    }

    /// Snapshot left behind by a remote-wins conflict resolution.
    pub fn take_reloaded(&self) -> Option<GraphSnapshot> {
        self.lock().reloaded.take()
    }

    /// One timer step: commit the newest pending snapshot if debounce and
    /// error back-off allow it.
    pub async fn tick(&self) -> Result<TickOutcome, SyncError> {
        let now = self.clock.now();
        let (snapshot, upto) = {
            let state = self.lock();
            let Some(latest) = state.pending.latest() else {
                return Ok(TickOutcome::Idle);
            };
            if let Some(last) = state.last_attempt {
                let since = elapsed_between(last, now);
                if since < self.config.min_commit_interval() {
                    return Ok(TickOutcome::Debounced);
                }
                if state.consecutive_errors >= self.config.error_backoff_threshold {
                    let backoff = self.config.min_commit_interval() * state.consecutive_errors;
                    if since < backoff {
                        tracing::debug!(
                            slug = %self.slug,
                            errors = state.consecutive_errors,
                            backoff_ms = backoff.as_millis() as u64,
                            "backing off after repeated commit failures"
                        );
                        return Ok(TickOutcome::BackingOff);
                    }
                }
            }
            (latest.snapshot.clone(), latest.seq)
        };

        let _guard = self.commit_lock.lock().await;
        let outcome = self.commit(&snapshot).await?;
        if let CommitOutcome::Committed { .. } = outcome {
            self.lock().pending.clear_through(upto);
        }
        Ok(TickOutcome::Committed(outcome))
    }

    /// Commit `snapshot` now, bypassing debounce. Pending changes queued
    /// before this call are considered covered by it.
    pub async fn force_commit(&self, snapshot: &GraphSnapshot) -> Result<CommitOutcome, SyncError> {
        let upto = self.lock().pending.last_seq();
        let _guard = self.commit_lock.lock().await;
        let outcome = self.commit(snapshot).await?;
        if let CommitOutcome::Committed { .. } = outcome {
            self.lock().pending.clear_through(upto);
        }
        Ok(outcome)
    }

    /// Read the workspace document from the remote: the primary file, or the
    /// shadow backup if the primary is missing or unparsable. `None` when
    /// neither yields a document.
    pub async fn load_from_git(&self) -> Result<Option<WorkspaceDocument>, SyncError> {
        let primary = self.target.path.clone();
        if let Some(doc) = self.read_document(&primary).await? {
            self.adopt(&doc);
            return Ok(Some(doc));
        }

        let backup = self.backup_path();
        match self.read_document(&backup).await {
            Ok(Some(doc)) => {
                tracing::warn!(slug = %self.slug, path = %backup, "primary unusable; loaded shadow backup");
                self.adopt(&doc);
                Ok(Some(doc))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(slug = %self.slug, path = %backup, error = %e, "shadow backup unreadable");
                Ok(None)
            }
        }
    }

    /// `Ok(None)` for a missing or unparsable file.
    async fn read_document(&self, path: &str) -> Result<Option<WorkspaceDocument>, SyncError> {
        let file = match self.provider.read_file(&self.target.repo, path).await {
            Ok(file) => file,
            Err(e) if e.is_not_found() => {
                tracing::debug!(slug = %self.slug, path, "remote document not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match WorkspaceDocument::parse(&file.content) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                tracing::warn!(slug = %self.slug, path, error = %e, "remote document unparsable");
                Ok(None)
            }
        }
    }

    /// Carry the loaded document's header forward so re-committing the same
    /// content does not move `modified`.
    fn adopt(&self, doc: &WorkspaceDocument) {
        let mut state = self.lock();
        state.stamp.created = doc.metadata.created;
        state.stamp.modified = doc.metadata.modified;
        if let Some(title) = doc.title() {
            state.stamp.title = title.to_string();
        }
        state.stamp.content_hash = DocumentStamp::fingerprint(&doc.snapshot).ok();
    }

    /// Write primary + backup; apply the conflict policy on a conflict.
    /// Caller holds `commit_lock`.
    async fn commit(&self, snapshot: &GraphSnapshot) -> Result<CommitOutcome, SyncError> {
        let now = self.clock.now();
        let content = {
            let mut state = self.lock();
            state.last_attempt = Some(now);
            state.stamp.stamp_and_render(snapshot, now)?
        };

        match self.write_primary(&content).await {
            Ok(revision) => Ok(self.committed(revision, &content).await),
            Err(e) if e.is_conflict() => self.resolve_conflict(&content).await,
            Err(e) => Err(self.failed(e.into())),
        }
    }

    async fn write_primary(&self, content: &str) -> Result<String, StorageError> {
        write_with_latest_revision(
            self.provider.as_ref(),
            &self.target.repo,
            &self.target.path,
            content,
        )
        .await
    }

    async fn resolve_conflict(&self, content: &str) -> Result<CommitOutcome, SyncError> {
        let source_of_truth = self.source_of_truth();
        if source_of_truth == SourceOfTruth::Remote {
            tracing::warn!(slug = %self.slug, "write conflict; remote is source of truth, reloading");
            let loaded = match self.load_from_git().await {
                Ok(loaded) => loaded,
                Err(e) => return Err(self.failed(e)),
            };
            {
                let mut state = self.lock();
                state.pending.clear();
                state.reloaded = Some(loaded.map(|d| d.snapshot).unwrap_or_default());
                state.consecutive_errors = 0;
                state.last_error = None;
            }
            self.events.dispatch(StatusEvent::ConflictResolved {
                slug: self.slug.clone(),
                resolution: ConflictResolution::RemoteWins,
            });
            self.events.dispatch(StatusEvent::RemoteReloaded {
                slug: self.slug.clone(),
            });
            return Ok(CommitOutcome::ReloadedFromRemote);
        }

        let delay = self.config.conflict_retry_delay();
        tracing::warn!(
            slug = %self.slug,
            source_of_truth = %source_of_truth,
            delay_ms = delay.as_millis() as u64,
            "write conflict; retrying once"
        );
        self.clock.sleep(delay).await;

        match self.write_primary(content).await {
            Ok(revision) => {
                self.events.dispatch(StatusEvent::ConflictResolved {
                    slug: self.slug.clone(),
                    resolution: ConflictResolution::Retried,
                });
                Ok(self.committed(revision, content).await)
            }
            Err(e) if e.is_conflict() => Err(self.failed(SyncError::ConflictPersisted {
                path: self.target.path.clone(),
            })),
            Err(e) => Err(self.failed(e.into())),
        }
    }

    async fn committed(&self, revision: String, content: &str) -> CommitOutcome {
        let backup = self.backup_path();
        if let Err(e) = write_with_latest_revision(
            self.provider.as_ref(),
            &self.target.repo,
            &backup,
            content,
        )
        .await
        {
            // The primary is safe; a missing backup only weakens recovery.
            tracing::warn!(slug = %self.slug, path = %backup, error = %e, "shadow backup write failed");
        }

        let now = self.clock.now();
        {
            let mut state = self.lock();
            state.last_commit = Some(now);
            state.consecutive_errors = 0;
            state.last_error = None;
        }
        tracing::info!(slug = %self.slug, revision = %revision, "committed workspace to remote");
        self.events.dispatch(StatusEvent::CommitSucceeded {
            slug: self.slug.clone(),
            revision: revision.clone(),
            at: now,
        });
        CommitOutcome::Committed { revision }
    }

    fn failed(&self, error: SyncError) -> SyncError {
        let consecutive_errors = {
            let mut state = self.lock();
            state.consecutive_errors += 1;
            state.last_error = Some(error.to_string());
            state.consecutive_errors
        };
        tracing::warn!(slug = %self.slug, consecutive_errors, error = %error, "commit failed");
        self.events.dispatch(StatusEvent::CommitFailed {
            slug: self.slug.clone(),
            error: error.to_string(),
            consecutive_errors,
        });
        if error.is_auth() {
            self.events.dispatch(StatusEvent::AuthRequired {
                slug: self.slug.clone(),
                message: error.to_string(),
            });
        }
        error
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                let _ = worker.shutdown.send(true);
            }
        }
    }
}
