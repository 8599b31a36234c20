// registry.rs — WorkspaceRegistry: owns the workspaces and orchestrates
// load / save / switch / discover across the three storage tiers.
//
// One registry per process, owned by the host and injected where needed.
// The workspace list, active pointer and per-workspace snapshots live in a
// std `Mutex` that is only ever held for synchronous updates; every await
// point (tier I/O, engine commits) happens with the lock released, so the
// list is never left half-updated across a suspension point.
//
// Load order for a workspace: its declared source of truth, then the other
// enabled tiers in local → remote → cache order, then an empty bootstrap
// snapshot. A multi-tier save succeeds if any tier succeeds; each failing
// tier is logged and reported as a `TierDegraded` status event.
//
// Sync engines are provisioned lazily: the first time a workspace with an
// enabled remote tier is loaded, saved or linked. At most one live engine
// exists per slug (`set_sync_engine` rejects and stops a duplicate).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use redstring_document::{GraphSnapshot, WorkspaceDocument};
use redstring_storage::{
    CacheBackend, CacheStore, DirCacheBackend, FileHandleFactory, FsHandleFactory, HandleStatus,
    LocalFileTier, RemoteProvider, RepoRef, SharedClock, SourceOfTruth, StorageError, SystemClock,
    Tier,
};
use redstring_sync::{
    CommitOutcome, EventDispatcher, StatusEvent, SyncEngine, SyncEngineOptions, SyncStatus,
};

use crate::config::{RegistryConfig, RemoteEmptyPolicy};
use crate::discovery::{DiscoveredWorkspace, DiscoveryReport, DiscoveryService};
use crate::error::{TierFailure, WorkspaceError};
use crate::slug::{slugify, unique_slug};
use crate::store::{RegistrySnapshot, RegistryStore};
use crate::workspace::{Workspace, WorkspaceOptions, WorkspaceUpdate};

/// Name of the workspace a fresh registry starts with.
pub const DEFAULT_WORKSPACE_NAME: &str = "Universe";

/// Options for [`WorkspaceRegistry::switch_active_workspace`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchOptions {
    /// Persist the outgoing workspace (all tiers, no debounce) first.
    pub save_current: bool,
    /// The outgoing workspace's latest snapshot. Falls back to the last
    /// snapshot the registry saw for it.
    pub snapshot: Option<GraphSnapshot>,
}

/// Per-tier outcome of a multi-tier save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub slug: String,
    /// Written synchronously.
    pub saved: Vec<Tier>,
    /// Handed to the sync engine for its next debounced commit.
    pub queued: Vec<Tier>,
    /// Not attempted (local tier awaiting reconnect).
    pub skipped: Vec<Tier>,
    pub failed: Vec<TierFailure>,
    /// The remote tier won a write conflict; the saved snapshot was replaced
    /// by the remote one.
    pub reloaded_from_remote: bool,
}

impl SaveReport {
    pub fn succeeded(&self) -> bool {
        !self.saved.is_empty() || !self.queued.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
    /// Remote tier goes through the engine's debounce queue.
    Debounced,
    /// Remote tier is committed now.
    Immediate,
}

enum TierSave {
    Saved,
    Queued,
    Skipped,
    Reloaded,
}

struct RegistryState {
    /// Creation order.
    workspaces: Vec<Workspace>,
    active: String,
    /// Last snapshot loaded or saved per slug.
    snapshots: HashMap<String, GraphSnapshot>,
}

impl RegistryState {
    fn get(&self, slug: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.slug.eq_ignore_ascii_case(slug))
    }

    fn get_mut(&mut self, slug: &str) -> Option<&mut Workspace> {
        self.workspaces
            .iter_mut()
            .find(|w| w.slug.eq_ignore_ascii_case(slug))
    }

    fn slug_taken(&self, slug: &str) -> bool {
        self.get(slug).is_some()
    }

    fn to_snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::new(self.active.clone(), self.workspaces.clone())
    }
}

/// Builder for [`WorkspaceRegistry`]. Anything not supplied gets the
/// production default derived from the config.
pub struct RegistryBuilder {
    config: RegistryConfig,
    clock: Option<SharedClock>,
    events: Option<Arc<EventDispatcher>>,
    provider: Option<Arc<dyn RemoteProvider>>,
    cache: Option<Arc<dyn CacheBackend>>,
    handles: Option<Arc<dyn FileHandleFactory>>,
    persist: bool,
}

impl RegistryBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            clock: None,
            events: None,
            provider: None,
            cache: None,
            handles: None,
            persist: true,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn RemoteProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn cache_backend(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn handle_factory(mut self, handles: Arc<dyn FileHandleFactory>) -> Self {
        self.handles = Some(handles);
        self
    }

    /// Whether to read and write `workspaces.json`. On by default.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn build(self) -> Result<WorkspaceRegistry, WorkspaceError> {
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let cache_backend: Arc<dyn CacheBackend> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(DirCacheBackend::new(
                self.config.cache_dir(),
                self.config.cache_quota_bytes,
            )?),
        };
        let handles: Arc<dyn FileHandleFactory> = match self.handles {
            Some(handles) => handles,
            None => Arc::new(FsHandleFactory::new(self.config.files_dir())),
        };
        let events = self.events.unwrap_or_else(EventDispatcher::with_tracing);
        let store = self
            .persist
            .then(|| RegistryStore::new(self.config.metadata_path()));

        let default = Workspace::new(
            slugify(DEFAULT_WORKSPACE_NAME),
            DEFAULT_WORKSPACE_NAME,
            clock.now(),
        );
        let state = RegistryState {
            active: default.slug.clone(),
            workspaces: vec![default],
            snapshots: HashMap::new(),
        };

        Ok(WorkspaceRegistry {
            cache: CacheStore::new(cache_backend, clock.clone()),
            config: self.config,
            clock,
            events,
            provider: self.provider,
            handles,
            store,
            state: Mutex::new(state),
            engines: Mutex::new(HashMap::new()),
            local_tiers: Mutex::new(HashMap::new()),
            initialized: tokio::sync::Mutex::new(false),
        })
    }
}

pub struct WorkspaceRegistry {
    config: RegistryConfig,
    clock: SharedClock,
    events: Arc<EventDispatcher>,
    provider: Option<Arc<dyn RemoteProvider>>,
    cache: CacheStore,
    handles: Arc<dyn FileHandleFactory>,
    store: Option<RegistryStore>,
    state: Mutex<RegistryState>,
    engines: Mutex<HashMap<String, Arc<SyncEngine>>>,
    local_tiers: Mutex<HashMap<String, Arc<LocalFileTier>>>,
    initialized: tokio::sync::Mutex<bool>,
}

impl WorkspaceRegistry {
    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<String, Arc<SyncEngine>>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local_tiers(&self) -> MutexGuard<'_, HashMap<String, Arc<LocalFileTier>>> {
        self.local_tiers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Restore persisted metadata, re-verify local file handles and try to
    /// hydrate the active workspace within `init_timeout`. Idempotent.
    pub async fn initialize(&self) -> Result<(), WorkspaceError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        if let Err(e) = self.restore_metadata() {
            tracing::error!(error = %e, "workspace registry failed to initialize");
            self.events.dispatch(StatusEvent::RegistryFailed {
                error: e.to_string(),
            });
            return Err(e);
        }
        self.restore_local_handles().await;

        let active = self.lock().active.clone();
        let timeout = self.config.init_timeout();
        match tokio::time::timeout(timeout, self.load_workspace(&active)).await {
            Ok(snapshot) => {
                self.lock().snapshots.insert(active.clone(), snapshot);
            }
            Err(_) => {
                tracing::warn!(
                    slug = %active,
                    timeout_ms = timeout.as_millis() as u64,
                    "initial hydration timed out; continuing with an empty workspace"
                );
            }
        }

        self.persist_or_warn();
        *initialized = true;
        tracing::info!(
            workspaces = self.lock().workspaces.len(),
            active = %active,
            "workspace registry ready"
        );
        self.events.dispatch(StatusEvent::RegistryReady);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    fn restore_metadata(&self) -> Result<(), WorkspaceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(saved) = store.load()? else {
            tracing::debug!(path = %store.path().display(), "no saved workspace list");
            return Ok(());
        };
        if saved.workspaces.is_empty() {
            tracing::warn!(path = %store.path().display(), "saved workspace list is empty; keeping default");
            return Ok(());
        }

        let mut workspaces: Vec<Workspace> = Vec::with_capacity(saved.workspaces.len());
        for mut ws in saved.workspaces {
            if workspaces.iter().any(|w| w.slug.eq_ignore_ascii_case(&ws.slug)) {
                tracing::warn!(slug = %ws.slug, "dropping duplicate workspace slug from saved list");
                continue;
            }
            ws.normalize();
            workspaces.push(ws);
        }

        let active = workspaces
            .iter()
            .find(|w| w.slug.eq_ignore_ascii_case(&saved.active_slug))
            .or_else(|| workspaces.first())
            .map(|w| w.slug.clone());

        let mut state = self.lock();
        if let Some(active) = active {
            state.active = active;
        }
        state.workspaces = workspaces;
        state.snapshots.clear();
        tracing::info!(count = state.workspaces.len(), active = %state.active, "restored workspace list");
        Ok(())
    }

    async fn restore_local_handles(&self) {
        let targets: Vec<(String, String)> = self
            .lock()
            .workspaces
            .iter()
            .filter(|w| w.local_file.enabled)
            .filter_map(|w| w.local_file.path.clone().map(|p| (w.slug.clone(), p)))
            .collect();

        for (slug, path) in targets {
            let tier = Arc::new(LocalFileTier::restore(self.handles.open(&path)).await);
            let status = tier.status();
            self.local_tiers().insert(slug.clone(), tier);
            if let Some(ws) = self.lock().get_mut(&slug) {
                ws.local_file.handle_status = status;
            }
            if status == HandleStatus::NeedsReconnect {
                self.events
                    .dispatch(StatusEvent::TierNeedsReconnect { slug, path });
            }
        }
    }

    /// Stop every sync engine. In-flight commits run to completion.
    pub fn shutdown(&self) {
        let engines: Vec<Arc<SyncEngine>> = self.engines().values().cloned().collect();
        for engine in engines {
            engine.stop();
        }
        tracing::info!("workspace registry shut down");
    }

    fn persist(&self) -> Result<(), WorkspaceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.lock().to_snapshot();
        store.save(&snapshot)
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist workspace list");
        }
    }

    // ── Queries ──────────────────────────────────────────────

    pub fn get_all_workspaces(&self) -> Vec<Workspace> {
        self.lock().workspaces.clone()
    }

    pub fn get_workspace(&self, slug: &str) -> Option<Workspace> {
        self.lock().get(slug).cloned()
    }

    pub fn get_active_workspace(&self) -> Result<Workspace, WorkspaceError> {
        let state = self.lock();
        state
            .get(&state.active)
            .cloned()
            .ok_or_else(|| WorkspaceError::NotFound {
                slug: state.active.clone(),
            })
    }

    pub fn active_slug(&self) -> String {
        self.lock().active.clone()
    }

    /// The latest in-memory snapshot of the active workspace, including any
    /// state a remote-wins conflict left behind.
    pub fn current_snapshot(&self) -> GraphSnapshot {
        let active = self.active_slug();
        let reloaded = self.engines().get(&active).and_then(|e| e.take_reloaded());
        let mut state = self.lock();
        if let Some(snapshot) = reloaded {
            state.snapshots.insert(active.clone(), snapshot);
        }
        state.snapshots.get(&active).cloned().unwrap_or_default()
    }

    pub fn sync_status(&self, slug: &str) -> Result<Option<SyncStatus>, WorkspaceError> {
        if self.get_workspace(slug).is_none() {
            return Err(WorkspaceError::NotFound {
                slug: slug.to_string(),
            });
        }
        Ok(self.engines().get(slug).map(|e| e.status()))
    }

    pub fn all_sync_statuses(&self) -> Vec<SyncStatus> {
        let mut statuses: Vec<SyncStatus> = self.engines().values().map(|e| e.status()).collect();
        statuses.sort_by(|a, b| a.slug.cmp(&b.slug));
        statuses
    }

    pub fn sync_engine(&self, slug: &str) -> Option<Arc<SyncEngine>> {
        self.engines().get(slug).cloned()
    }

    // ── Mutations ────────────────────────────────────────────

    pub fn create_workspace(
        &self,
        name: &str,
        options: WorkspaceOptions,
    ) -> Result<Workspace, WorkspaceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkspaceError::InvalidName(name.to_string()));
        }

        let now = self.clock.now();
        let ws = {
            let mut state = self.lock();
            let slug = unique_slug(&slugify(name), |s| state.slug_taken(s));
            let ws = Workspace::from_options(slug, name, options, now);
            state.workspaces.push(ws.clone());
            ws
        };
        let ws = self.attach_local_tier(ws);

        self.persist()?;
        tracing::info!(slug = %ws.slug, tiers = ?ws.enabled_tiers(), "created workspace");
        Ok(ws)
    }

    /// Merge `update` into the workspace, renormalize, and retarget or tear
    /// down its sync engine to match the new remote configuration.
    pub fn update_workspace(
        &self,
        slug: &str,
        update: WorkspaceUpdate,
    ) -> Result<Workspace, WorkspaceError> {
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(WorkspaceError::InvalidName(name.clone()));
            }
        }

        let (before, after, is_active) = {
            let mut state = self.lock();
            let is_active = state.active.eq_ignore_ascii_case(slug);
            let ws = state.get_mut(slug).ok_or_else(|| WorkspaceError::NotFound {
                slug: slug.to_string(),
            })?;
            let before = ws.clone();
            ws.apply(update);
            (before, ws.clone(), is_active)
        };

        if before.local_file.path != after.local_file.path || !after.local_file.enabled {
            self.local_tiers().remove(&after.slug);
        }
        let after = self.attach_local_tier(after);

        let target = after.remote_target();
        if target.is_none() || target != before.remote_target() {
            self.teardown_engine(&after.slug);
        } else if let Some(engine) = self.sync_engine(&after.slug) {
            engine.set_source_of_truth(after.source_of_truth);
        }
        if target.is_some() && is_active {
            if let Err(e) = self.ensure_engine(&after) {
                tracing::warn!(slug = %after.slug, error = %e, "could not provision sync engine");
            }
        }

        self.persist()?;
        tracing::info!(slug = %after.slug, tiers = ?after.enabled_tiers(), "updated workspace");
        Ok(after)
    }

    /// Delete a workspace. The last remaining workspace cannot be deleted.
    /// Deleting the active workspace activates the first remaining one.
    pub async fn delete_workspace(&self, slug: &str) -> Result<(), WorkspaceError> {
        let (removed, reactivated) = {
            let mut state = self.lock();
            let index = state
                .workspaces
                .iter()
                .position(|w| w.slug.eq_ignore_ascii_case(slug))
                .ok_or_else(|| WorkspaceError::NotFound {
                    slug: slug.to_string(),
                })?;
            if state.workspaces.len() == 1 {
                return Err(WorkspaceError::LastWorkspace {
                    slug: slug.to_string(),
                });
            }
            let removed = state.workspaces.remove(index);
            state.snapshots.remove(&removed.slug);
            let reactivated = if state.active == removed.slug {
                let next = state.workspaces[0].slug.clone();
                state.active = next.clone();
                Some(next)
            } else {
                None
            };
            (removed, reactivated)
        };

        self.teardown_engine(&removed.slug);
        self.local_tiers().remove(&removed.slug);
        if let Err(e) = self.cache.remove(&removed.cache_slot.key) {
            tracing::warn!(slug = %removed.slug, error = %e, "failed to remove cached snapshot");
        }
        self.persist()?;
        tracing::info!(slug = %removed.slug, "deleted workspace");

        if let Some(next) = reactivated {
            let snapshot = self.load_workspace(&next).await;
            self.lock().snapshots.insert(next.clone(), snapshot);
            self.events.dispatch(StatusEvent::WorkspaceSwitched {
                from: Some(removed.slug),
                to: next,
            });
        }
        Ok(())
    }

    /// Point the local tier at a (re)granted file and clear
    /// `needs_reconnect`.
    pub fn relink_local_file(&self, slug: &str, path: &str) -> Result<Workspace, WorkspaceError> {
        let tier = Arc::new(LocalFileTier::new(self.handles.open(path)));
        let ws = {
            let mut state = self.lock();
            let ws = state.get_mut(slug).ok_or_else(|| WorkspaceError::NotFound {
                slug: slug.to_string(),
            })?;
            ws.local_file.enabled = true;
            ws.local_file.path = Some(path.to_string());
            ws.local_file.handle_status = tier.status();
            ws.normalize();
            ws.clone()
        };
        self.local_tiers().insert(ws.slug.clone(), tier);
        self.persist()?;
        tracing::info!(slug = %ws.slug, path, "relinked local file");
        Ok(ws)
    }

    fn attach_local_tier(&self, ws: Workspace) -> Workspace {
        let Some(path) = ws.local_file.path.clone().filter(|_| ws.local_file.enabled) else {
            return ws;
        };
        if self.local_tiers().contains_key(&ws.slug) {
            return ws;
        }
        let tier = Arc::new(LocalFileTier::new(self.handles.open(&path)));
        let status = tier.status();
        self.local_tiers().insert(ws.slug.clone(), tier);
        let mut state = self.lock();
        match state.get_mut(&ws.slug) {
            Some(stored) => {
                stored.local_file.handle_status = status;
                stored.clone()
            }
            None => ws,
        }
    }

    // ── Switching ────────────────────────────────────────────

    /// Make `slug` the active workspace and return its loaded snapshot.
    ///
    /// Tier exhaustion never fails the switch: the workspace then opens with
    /// an empty bootstrap snapshot. Only an unknown slug is an error.
    pub async fn switch_active_workspace(
        &self,
        slug: &str,
        options: SwitchOptions,
    ) -> Result<GraphSnapshot, WorkspaceError> {
        let (from, to) = {
            let state = self.lock();
            let to = state
                .get(slug)
                .map(|w| w.slug.clone())
                .ok_or_else(|| WorkspaceError::NotFound {
                    slug: slug.to_string(),
                })?;
            (state.active.clone(), to)
        };

        if options.save_current {
            let outgoing = options
                .snapshot
                .or_else(|| self.lock().snapshots.get(&from).cloned());
            match outgoing {
                Some(snapshot) => {
                    if let Err(e) = self.force_save(&from, &snapshot).await {
                        tracing::warn!(slug = %from, error = %e, "saving outgoing workspace failed; switching anyway");
                    }
                }
                None => tracing::debug!(slug = %from, "nothing to save for outgoing workspace"),
            }
        }

        self.lock().active = to.clone();
        self.persist_or_warn();

        let snapshot = self.load_workspace(&to).await;
        self.lock().snapshots.insert(to.clone(), snapshot.clone());
        tracing::info!(from = %from, to = %to, nodes = snapshot.nodes.len(), "switched active workspace");
        self.events.dispatch(StatusEvent::WorkspaceSwitched {
            from: Some(from),
            to,
        });
        Ok(snapshot)
    }

    // ── Loading ──────────────────────────────────────────────

    /// Load by tier priority, falling back to an empty bootstrap snapshot.
    async fn load_workspace(&self, slug: &str) -> GraphSnapshot {
        let Some(ws) = self.get_workspace(slug) else {
            return GraphSnapshot::bootstrap();
        };

        for tier in ws.load_order() {
            match self.load_tier(&ws, tier).await {
                Ok(Some(doc)) => {
                    if tier == Tier::Remote
                        && ws.source_of_truth == SourceOfTruth::Remote
                        && !doc.stats().has_content()
                    {
                        if let Some(cached) = self.cached_content(&ws) {
                            tracing::info!(
                                slug = %ws.slug,
                                nodes = cached.stats().node_count,
                                "remote document is empty; keeping cached snapshot"
                            );
                            return cached.snapshot;
                        }
                    }
                    tracing::info!(slug = %ws.slug, tier = %tier, "loaded workspace");
                    return doc.snapshot;
                }
                Ok(None) => {
                    tracing::debug!(slug = %ws.slug, tier = %tier, "tier holds no document");
                }
                Err(e) => self.tier_degraded(&ws.slug, tier, &e),
            }
        }

        tracing::info!(slug = %ws.slug, "no tier yielded a document; starting empty");
        GraphSnapshot::bootstrap()
    }

    /// The cache tier's snapshot if the empty-remote policy allows keeping
    /// it and it has content.
    fn cached_content(&self, ws: &Workspace) -> Option<WorkspaceDocument> {
        if self.config.remote_empty_policy != RemoteEmptyPolicy::PreferCache
            || !ws.cache_slot.enabled
        {
            return None;
        }
        let entry = self.cache.load(&ws.cache_slot.key).ok().flatten()?;
        WorkspaceDocument::parse(&entry.content)
            .ok()
            .filter(|doc| doc.stats().has_content())
    }

    async fn load_tier(
        &self,
        ws: &Workspace,
        tier: Tier,
    ) -> Result<Option<WorkspaceDocument>, WorkspaceError> {
        match tier {
            Tier::Local => {
                let Some(local) = self.local_tiers().get(&ws.slug).cloned() else {
                    return Ok(None);
                };
                match local.load().await {
                    Ok(content) => Ok(Some(WorkspaceDocument::parse(&content)?)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => {
                        self.observe_local(&ws.slug, &local);
                        Err(e.into())
                    }
                }
            }
            Tier::Remote => {
                let engine = self.ensure_engine(ws)?;
                Ok(engine.load_from_git().await?)
            }
            Tier::Cache => match self.cache.load(&ws.cache_slot.key)? {
                Some(entry) => Ok(Some(WorkspaceDocument::parse(&entry.content)?)),
                None => Ok(None),
            },
        }
    }

    // ── Saving ───────────────────────────────────────────────

    /// Save the active workspace to every enabled tier. The remote tier is
    /// queued on the sync engine's debounce timer.
    pub async fn save_active_workspace(
        &self,
        snapshot: &GraphSnapshot,
    ) -> Result<SaveReport, WorkspaceError> {
        let active = self.active_slug();
        self.save_workspace(&active, snapshot, SaveMode::Debounced)
            .await
    }

    /// Save to every enabled tier now, committing the remote tier without
    /// debounce.
    pub async fn force_save(
        &self,
        slug: &str,
        snapshot: &GraphSnapshot,
    ) -> Result<SaveReport, WorkspaceError> {
        self.save_workspace(slug, snapshot, SaveMode::Immediate)
            .await
    }

    async fn save_workspace(
        &self,
        slug: &str,
        snapshot: &GraphSnapshot,
        mode: SaveMode,
    ) -> Result<SaveReport, WorkspaceError> {
        let ws = self
            .get_workspace(slug)
            .ok_or_else(|| WorkspaceError::NotFound {
                slug: slug.to_string(),
            })?;
        let now = self.clock.now();
        let mut stamp = ws.stamp();
        let content = stamp.stamp_and_render(snapshot, now)?;

        let mut report = SaveReport {
            slug: ws.slug.clone(),
            ..Default::default()
        };
        for tier in ws.enabled_tiers() {
            let result = match tier {
                Tier::Local => self.save_local(&ws, &content).await,
                Tier::Remote => self.save_remote(&ws, snapshot, mode).await,
                Tier::Cache => self
                    .cache
                    .save(&ws.cache_slot.key, &content)
                    .map(|()| TierSave::Saved)
                    .map_err(WorkspaceError::from),
            };
            match result {
                Ok(TierSave::Saved) => report.saved.push(tier),
                Ok(TierSave::Queued) => report.queued.push(tier),
                Ok(TierSave::Skipped) => report.skipped.push(tier),
                Ok(TierSave::Reloaded) => {
                    report.saved.push(tier);
                    report.reloaded_from_remote = true;
                }
                Err(e) => {
                    self.tier_degraded(&ws.slug, tier, &e);
                    report.failed.push(TierFailure {
                        tier,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.succeeded() {
            let mut failures = report.failed;
            failures.extend(report.skipped.into_iter().map(|tier| TierFailure {
                tier,
                error: "tier needs reconnect".to_string(),
            }));
            tracing::error!(slug = %ws.slug, failed = failures.len(), "save failed on every tier");
            return Err(WorkspaceError::AllTiersFailed {
                slug: ws.slug,
                failures,
            });
        }

        let reloaded = report
            .reloaded_from_remote
            .then(|| self.sync_engine(&ws.slug).and_then(|e| e.take_reloaded()))
            .flatten();
        {
            let mut state = self.lock();
            if let Some(stored) = state.get_mut(&ws.slug) {
                stored.record_save(&stamp, snapshot.stats(), now);
            }
            state
                .snapshots
                .insert(ws.slug.clone(), reloaded.unwrap_or_else(|| snapshot.clone()));
        }
        self.persist_or_warn();

        tracing::debug!(
            slug = %ws.slug,
            saved = ?report.saved,
            queued = ?report.queued,
            failed = report.failed.len(),
            "saved workspace"
        );
        Ok(report)
    }

    async fn save_local(&self, ws: &Workspace, content: &str) -> Result<TierSave, WorkspaceError> {
        let Some(local) = self.local_tiers().get(&ws.slug).cloned() else {
            return Err(StorageError::Unavailable(format!(
                "local file for '{}' is not linked",
                ws.slug
            ))
            .into());
        };
        if local.needs_reconnect() {
            tracing::debug!(slug = %ws.slug, "local tier awaiting reconnect; skipping");
            return Ok(TierSave::Skipped);
        }
        match local.save(content).await {
            Ok(()) => Ok(TierSave::Saved),
            Err(e) => {
                self.observe_local(&ws.slug, &local);
                Err(e.into())
            }
        }
    }

    async fn save_remote(
        &self,
        ws: &Workspace,
        snapshot: &GraphSnapshot,
        mode: SaveMode,
    ) -> Result<TierSave, WorkspaceError> {
        let engine = self.ensure_engine(ws)?;
        match mode {
            SaveMode::Debounced => {
                engine.update_state(snapshot.clone());
                Ok(TierSave::Queued)
            }
            SaveMode::Immediate => match engine.force_commit(snapshot).await? {
                CommitOutcome::Committed { .. } => Ok(TierSave::Saved),
                CommitOutcome::ReloadedFromRemote => Ok(TierSave::Reloaded),
            },
        }
    }

    /// Mirror a local tier that just fell into `needs_reconnect` into the
    /// workspace record and notify the host.
    fn observe_local(&self, slug: &str, local: &LocalFileTier) {
        if !local.needs_reconnect() {
            return;
        }
        let changed = {
            let mut state = self.lock();
            match state.get_mut(slug) {
                Some(ws) if ws.local_file.handle_status != HandleStatus::NeedsReconnect => {
                    ws.local_file.handle_status = HandleStatus::NeedsReconnect;
                    true
                }
                _ => false,
            }
        };
        if changed {
            tracing::warn!(slug, path = local.path(), "local tier needs reconnect");
            self.events.dispatch(StatusEvent::TierNeedsReconnect {
                slug: slug.to_string(),
                path: local.path().to_string(),
            });
        }
    }

    fn tier_degraded(&self, slug: &str, tier: Tier, error: &WorkspaceError) {
        tracing::warn!(slug, tier = %tier, error = %error, "tier failed; continuing with remaining tiers");
        self.events.dispatch(StatusEvent::TierDegraded {
            slug: slug.to_string(),
            tier,
            error: error.to_string(),
        });
    }

    // ── Sync engines ─────────────────────────────────────────

    /// Register `engine` as the sync engine for `slug`.
    ///
    /// If a running engine is already registered, the new one is stopped
    /// immediately and rejected; the original stays the sole registrant.
    /// A stopped registrant is replaced.
    pub fn set_sync_engine(&self, slug: &str, engine: Arc<SyncEngine>) -> Result<(), WorkspaceError> {
        let slug = self
            .get_workspace(slug)
            .map(|w| w.slug)
            .ok_or_else(|| WorkspaceError::NotFound {
                slug: slug.to_string(),
            })?;

        let mut engines = self.engines();
        if let Some(existing) = engines.get(&slug) {
            if Arc::ptr_eq(existing, &engine) {
                return Ok(());
            }
            if existing.is_running() {
                drop(engines);
                tracing::warn!(slug = %slug, "rejecting duplicate sync engine");
                engine.stop();
                return Err(WorkspaceError::EngineAlreadyRegistered { slug });
            }
            tracing::debug!(slug = %slug, "replacing stopped sync engine");
        }
        engines.insert(slug, engine);
        Ok(())
    }

    /// The workspace's running engine, created and started on first use.
    fn ensure_engine(&self, ws: &Workspace) -> Result<Arc<SyncEngine>, WorkspaceError> {
        let target = ws
            .remote_target()
            .ok_or_else(|| StorageError::Unavailable(format!("remote tier disabled for '{}'", ws.slug)))?;

        if let Some(engine) = self.sync_engine(&ws.slug) {
            if engine.target() == &target {
                engine.set_source_of_truth(ws.source_of_truth);
                engine.start();
                return Ok(engine);
            }
            self.teardown_engine(&ws.slug);
        }

        let provider = self.provider.clone().ok_or(WorkspaceError::NoProvider)?;
        let engine = SyncEngine::new(
            SyncEngineOptions {
                slug: ws.slug.clone(),
                target,
                source_of_truth: ws.source_of_truth,
                stamp: ws.stamp(),
                config: self.config.sync.clone(),
            },
            provider,
            self.clock.clone(),
            self.events.clone(),
        );
        match self.set_sync_engine(&ws.slug, engine.clone()) {
            Ok(()) => {
                engine.start();
                Ok(engine)
            }
            // Lost a race with another provisioning call; use the winner.
            Err(WorkspaceError::EngineAlreadyRegistered { slug }) => self
                .sync_engine(&slug)
                .ok_or(WorkspaceError::EngineAlreadyRegistered { slug }),
            Err(e) => Err(e),
        }
    }

    fn teardown_engine(&self, slug: &str) {
        let removed = self.engines().remove(slug);
        if let Some(engine) = removed {
            engine.stop();
            tracing::info!(slug, "sync engine torn down");
        }
    }

    // ── Discovery ────────────────────────────────────────────

    pub async fn discover_workspaces_in_repository(
        &self,
        repo: &RepoRef,
    ) -> Result<DiscoveryReport, WorkspaceError> {
        let provider = self.provider.clone().ok_or(WorkspaceError::NoProvider)?;
        DiscoveryService::new(
            provider,
            self.config.discovery_root.clone(),
            self.config.discovery_max_depth,
        )
        .scan(repo)
        .await
    }

    /// Create a workspace for a discovered document, or re-link the existing
    /// workspace already pointing at it, and provision its sync engine.
    pub fn link_discovered_workspace(
        &self,
        discovered: &DiscoveredWorkspace,
        repo: &RepoRef,
    ) -> Result<Workspace, WorkspaceError> {
        if self.provider.is_none() {
            return Err(WorkspaceError::NoProvider);
        }

        let existing = self
            .lock()
            .workspaces
            .iter()
            .find(|w| {
                w.remote_repo.linked_repo.as_ref() == Some(repo) && w.remote_path() == discovered.path
            })
            .map(|w| w.slug.clone());

        let ws = match existing {
            Some(slug) => {
                tracing::info!(slug = %slug, path = %discovered.path, "re-linking discovered workspace");
                self.update_workspace(
                    &slug,
                    WorkspaceUpdate {
                        enable_remote: Some(true),
                        linked_repo: Some(repo.clone()),
                        ..Default::default()
                    },
                )?
            }
            None => {
                let now = self.clock.now();
                let ws = {
                    let mut state = self.lock();
                    let slug = unique_slug(&discovered.slug, |s| state.slug_taken(s));
                    let ws = Workspace::from_options(
                        slug,
                        discovered.name.clone(),
                        WorkspaceOptions {
                            source_of_truth: Some(SourceOfTruth::Remote),
                            enable_remote: true,
                            linked_repo: Some(repo.clone()),
                            folder: Some(discovered.folder.clone()),
                            file_name: Some(discovered.file_name.clone()),
                            ..Default::default()
                        },
                        now,
                    );
                    state.workspaces.push(ws.clone());
                    ws
                };
                self.persist()?;
                tracing::info!(slug = %ws.slug, path = %discovered.path, "linked discovered workspace");
                ws
            }
        };

        self.ensure_engine(&ws)?;
        Ok(ws)
    }
}

impl Drop for WorkspaceRegistry {
    fn drop(&mut self) {
        let engines = self.engines.get_mut().unwrap_or_else(|e| e.into_inner());
        for engine in engines.values() {
            engine.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redstring_document::Node;
    use redstring_storage::{
        ManualClock, MemoryCacheBackend, MemoryHandleFactory, MemoryProvider, ScriptedFailure,
    };
    use redstring_sync::MemorySink;

    struct Fixture {
        registry: WorkspaceRegistry,
        provider: Arc<MemoryProvider>,
        cache: Arc<MemoryCacheBackend>,
        handles: Arc<MemoryHandleFactory>,
        sink: MemorySink,
        repo: RepoRef,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MemoryProvider::new());
        let repo = RepoRef::new("octo", "graphs");
        provider.add_repo(&repo);
        let cache = Arc::new(MemoryCacheBackend::new());
        let handles = Arc::new(MemoryHandleFactory::new());
        let sink = MemorySink::new();
        let events = Arc::new(EventDispatcher::new());
        events.add_sink(Box::new(sink.clone()));

        let registry = WorkspaceRegistry::builder(RegistryConfig::for_state_dir("/unused"))
            .clock(ManualClock::starting_now())
            .events(events)
            .provider(provider.clone())
            .cache_backend(cache.clone())
            .handle_factory(handles.clone())
            .persist(false)
            .build()
            .unwrap();
        Fixture {
            registry,
            provider,
            cache,
            handles,
            sink,
            repo,
        }
    }

    fn snapshot(ids: &[&str]) -> GraphSnapshot {
        let mut snapshot = GraphSnapshot::default();
        for id in ids {
            snapshot.nodes.insert(Node::new(*id, id.to_uppercase()));
        }
        snapshot
    }

    #[test]
    fn starts_with_one_active_default_workspace() {
        let f = fixture();
        let all = f.registry.get_all_workspaces();
        assert_eq!(all.len(), 1);
        assert_eq!(f.registry.get_active_workspace().unwrap().slug, "universe");
    }

    #[test]
    fn create_rejects_blank_name_and_dedupes_slugs() {
        let f = fixture();
        assert!(matches!(
            f.registry.create_workspace("  ", WorkspaceOptions::default()),
            Err(WorkspaceError::InvalidName(_))
        ));
        let a = f.registry.create_workspace("Alpha", WorkspaceOptions::default()).unwrap();
        let b = f.registry.create_workspace("ALPHA", WorkspaceOptions::default()).unwrap();
        assert_eq!(a.slug, "alpha");
        assert_eq!(b.slug, "alpha-2");
    }

    #[tokio::test]
    async fn delete_last_workspace_fails_and_changes_nothing() {
        let f = fixture();
        let before = f.registry.get_all_workspaces();
        let err = f.registry.delete_workspace("universe").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::LastWorkspace { .. }));
        assert_eq!(f.registry.get_all_workspaces(), before);
        assert_eq!(f.registry.active_slug(), "universe");
    }

    #[tokio::test]
    async fn deleting_active_workspace_reactivates_another() {
        let f = fixture();
        f.registry.create_workspace("Alpha", WorkspaceOptions::default()).unwrap();
        f.registry
            .switch_active_workspace("alpha", SwitchOptions::default())
            .await
            .unwrap();

        f.registry.delete_workspace("alpha").await.unwrap();
        assert_eq!(f.registry.active_slug(), "universe");
        assert!(f.registry.get_workspace("alpha").is_none());
        assert!(f.sink.types().contains(&"workspace_switched"));
    }

    #[tokio::test]
    async fn switch_to_unknown_slug_is_not_found() {
        let f = fixture();
        let err = f
            .registry
            .switch_active_workspace("nope", SwitchOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.registry.active_slug(), "universe");
    }

    #[tokio::test]
    async fn switch_with_exhausted_tiers_opens_bootstrap() {
        let f = fixture();
        f.registry.create_workspace("Fresh", WorkspaceOptions::default()).unwrap();
        let loaded = f
            .registry
            .switch_active_workspace("fresh", SwitchOptions::default())
            .await
            .unwrap();
        assert!(loaded.is_empty());
        assert_eq!(f.registry.active_slug(), "fresh");
    }

    #[tokio::test]
    async fn save_with_one_failing_tier_is_a_warning() {
        let f = fixture();
        f.registry
            .create_workspace(
                "Remote",
                WorkspaceOptions {
                    enable_remote: true,
                    linked_repo: Some(f.repo.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        f.provider.fail_next_write(ScriptedFailure::Network);

        let report = f.registry.force_save("remote", &snapshot(&["a"])).await.unwrap();
        assert_eq!(report.saved, vec![Tier::Cache]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].tier, Tier::Remote);
        assert!(f.sink.types().contains(&"tier_degraded"));
    }

    #[tokio::test]
    async fn save_fails_when_every_tier_fails() {
        let f = fixture();
        f.cache.set_quota(1);
        let err = f
            .registry
            .save_active_workspace(&snapshot(&["a"]))
            .await
            .unwrap_err();
        match err {
            WorkspaceError::AllTiersFailed { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].tier, Tier::Cache);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn save_records_stats_in_metadata() {
        let f = fixture();
        f.registry
            .save_active_workspace(&snapshot(&["a", "b"]))
            .await
            .unwrap();
        let ws = f.registry.get_active_workspace().unwrap();
        assert_eq!(ws.metadata.stats.node_count, 2);
        assert!(ws.metadata.last_saved.is_some());
        assert_eq!(f.registry.current_snapshot().nodes.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_engine_is_rejected_and_stopped() {
        let f = fixture();
        let ws = f
            .registry
            .create_workspace(
                "Linked",
                WorkspaceOptions {
                    enable_remote: true,
                    linked_repo: Some(f.repo.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        f.registry
            .switch_active_workspace("linked", SwitchOptions::default())
            .await
            .unwrap();
        let original = f.registry.sync_engine("linked").unwrap();
        assert!(original.is_running());

        let duplicate = SyncEngine::new(
            SyncEngineOptions {
                slug: ws.slug.clone(),
                target: ws.remote_target().unwrap(),
                source_of_truth: ws.source_of_truth,
                stamp: ws.stamp(),
                config: Default::default(),
            },
            f.provider.clone(),
            ManualClock::starting_now(),
            Arc::new(EventDispatcher::new()),
        );
        duplicate.start();

        let err = f.registry.set_sync_engine("linked", duplicate.clone()).unwrap_err();
        assert!(matches!(err, WorkspaceError::EngineAlreadyRegistered { .. }));
        assert!(!duplicate.is_running());
        assert!(original.is_running());
        assert!(Arc::ptr_eq(&f.registry.sync_engine("linked").unwrap(), &original));
    }

    #[tokio::test]
    async fn disabling_remote_tears_down_engine() {
        let f = fixture();
        f.registry
            .create_workspace(
                "Linked",
                WorkspaceOptions {
                    enable_remote: true,
                    linked_repo: Some(f.repo.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        f.registry
            .switch_active_workspace("linked", SwitchOptions::default())
            .await
            .unwrap();
        let engine = f.registry.sync_engine("linked").unwrap();

        f.registry
            .update_workspace(
                "linked",
                WorkspaceUpdate {
                    enable_remote: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!engine.is_running());
        assert!(f.registry.sync_engine("linked").is_none());
        assert!(f.registry.sync_status("linked").unwrap().is_none());
    }

    #[tokio::test]
    async fn relink_clears_needs_reconnect() {
        let f = fixture();
        f.registry
            .create_workspace(
                "Disk",
                WorkspaceOptions {
                    enable_local: true,
                    local_path: Some("disk.redstring".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        f.handles.handle("disk.redstring").revoke();
        f.registry.force_save("disk", &snapshot(&["a"])).await.unwrap();
        assert_eq!(
            f.registry.get_workspace("disk").unwrap().local_file.handle_status,
            HandleStatus::NeedsReconnect
        );

        f.handles.handle("disk-2.redstring");
        let ws = f.registry.relink_local_file("disk", "disk-2.redstring").unwrap();
        assert_eq!(ws.local_file.handle_status, HandleStatus::Connected);
        let report = f.registry.force_save("disk", &snapshot(&["a"])).await.unwrap();
        assert!(report.saved.contains(&Tier::Local));
    }

    #[tokio::test]
    async fn discovery_requires_provider() {
        let registry = WorkspaceRegistry::builder(RegistryConfig::for_state_dir("/unused"))
            .cache_backend(Arc::new(MemoryCacheBackend::new()))
            .handle_factory(Arc::new(MemoryHandleFactory::new()))
            .persist(false)
            .build()
            .unwrap();
        let err = registry
            .discover_workspaces_in_repository(&RepoRef::new("o", "r"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::NoProvider));
    }
}
