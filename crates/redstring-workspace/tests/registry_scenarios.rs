// registry_scenarios.rs — End-to-end registry behaviour over in-memory tiers.
//
//   1. Cache-only workspace: save, switch away, switch back, same snapshot
//   2. Discovery: one populated and one empty document yield one workspace,
//      which links into a remote-backed workspace with a running engine
//   3. Local permission revoked between saves: the tier is flagged
//      needs_reconnect and the save still succeeds via the cache
//   4. Two force saves of the same snapshot leave identical remote content
//   5. Remote-wins conflict: the engine reads before writing again and the
//      registry adopts the remote snapshot
//   6. Empty remote with a populated cache keeps the cache (and the
//      trust_remote policy does not)
//   7. Workspace list and local handle state survive a restart
//   8. A stalled provider cannot block initialize()
//   9. A document whose current-shape sections are empty but whose legacy
//      section holds nodes is discovered and loads with that content
//  10. A document discovered at the repository root links to the same
//      path, and saves update it in place

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;

use redstring_document::{DocumentStamp, GraphSnapshot, Node};
use redstring_storage::{
    AuthContext, DirEntry, HandleStatus, ManualClock, MemoryCacheBackend, MemoryHandleFactory,
    MemoryProvider, ProviderOp, RemoteFile, RemoteProvider, RepoRef, ScriptedFailure,
    StorageError, Tier,
};
use redstring_sync::{EventDispatcher, MemorySink};
use redstring_workspace::{
    RegistryConfig, RemoteEmptyPolicy, SwitchOptions, WorkspaceOptions, WorkspaceRegistry,
};

struct Harness {
    registry: WorkspaceRegistry,
    provider: Arc<MemoryProvider>,
    handles: Arc<MemoryHandleFactory>,
    sink: MemorySink,
    repo: RepoRef,
}

fn harness_with(config: RegistryConfig) -> Harness {
    let repo = RepoRef::new("ada", "knowledge");
    let provider = Arc::new(MemoryProvider::new());
    provider.add_repo(&repo);
    let handles = Arc::new(MemoryHandleFactory::new());
    let sink = MemorySink::new();
    let events = Arc::new(EventDispatcher::new());
    events.add_sink(Box::new(sink.clone()));

    let registry = WorkspaceRegistry::builder(config)
        .clock(ManualClock::starting_now())
        .events(events)
        .provider(provider.clone())
        .cache_backend(Arc::new(MemoryCacheBackend::new()))
        .handle_factory(handles.clone())
        .persist(false)
        .build()
        .unwrap();
    Harness {
        registry,
        provider,
        handles,
        sink,
        repo,
    }
}

fn harness() -> Harness {
    harness_with(RegistryConfig::for_state_dir("/unused"))
}

fn snapshot(ids: &[&str]) -> GraphSnapshot {
    let mut s = GraphSnapshot::default();
    for id in ids {
        s.nodes.insert(Node::new(*id, format!("Node {}", id)));
    }
    s
}

fn document(title: &str, snapshot: &GraphSnapshot) -> String {
    DocumentStamp::new(title, Utc::now()).render(snapshot).unwrap()
}

fn remote_options(repo: &RepoRef) -> WorkspaceOptions {
    WorkspaceOptions {
        enable_remote: true,
        linked_repo: Some(repo.clone()),
        ..Default::default()
    }
}

#[tokio::test]
async fn cache_only_workspace_round_trips_across_switches() {
    let h = harness();
    h.registry
        .create_workspace("Alpha", WorkspaceOptions::default())
        .unwrap();
    h.registry
        .create_workspace("Beta", WorkspaceOptions::default())
        .unwrap();

    // 1
    h.registry
        .switch_active_workspace("alpha", SwitchOptions::default())
        .await
        .unwrap();
    let saved = snapshot(&["n1", "n2"]);
    let report = h.registry.save_active_workspace(&saved).await.unwrap();
    assert_eq!(report.saved, vec![Tier::Cache]);

    let beta = h
        .registry
        .switch_active_workspace("beta", SwitchOptions::default())
        .await
        .unwrap();
    assert!(beta.is_empty());

    let loaded = h
        .registry
        .switch_active_workspace("alpha", SwitchOptions::default())
        .await
        .unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(h.registry.get_active_workspace().unwrap().slug, "alpha");
}

#[tokio::test]
async fn discovery_skips_empty_documents_and_links_the_rest() {
    let h = harness();
    h.provider.put_file(
        &h.repo,
        "universes/default/default.redstring",
        &document("Untitled", &snapshot(&["only"])),
    );
    h.provider.put_file(
        &h.repo,
        "universes/empty/empty.redstring",
        &document("Empty", &GraphSnapshot::default()),
    );
    h.provider.put_file(
        &h.repo,
        "universes/default/default.redstring.backup",
        &document("Untitled", &snapshot(&["only"])),
    );
    h.provider
        .put_file(&h.repo, "universes/broken/broken.redstring", "{not json");

    // 2
    let report = h
        .registry
        .discover_workspaces_in_repository(&h.repo)
        .await
        .unwrap();
    assert_eq!(report.workspaces.len(), 1);
    assert_eq!(report.stats.candidates, 3);
    assert_eq!(report.stats.valid, 1);
    assert_eq!(report.stats.invalid, 2);

    let found = &report.workspaces[0];
    assert_eq!(found.path, "universes/default/default.redstring");
    assert!(found.has_content);
    assert_eq!(found.stats.node_count, 1);
    assert_eq!(found.name, "default");

    let ws = h.registry.link_discovered_workspace(found, &h.repo).unwrap();
    assert_eq!(ws.remote_path(), found.path);
    assert!(ws.remote_repo.enabled);
    assert!(h.registry.sync_engine(&ws.slug).unwrap().is_running());

    // Linking the same document again re-links rather than duplicating.
    let again = h.registry.link_discovered_workspace(found, &h.repo).unwrap();
    assert_eq!(again.slug, ws.slug);
    assert_eq!(h.registry.get_all_workspaces().len(), 2);

    let loaded = h
        .registry
        .switch_active_workspace(&ws.slug, SwitchOptions::default())
        .await
        .unwrap();
    assert!(loaded.nodes.contains("only"));
}

#[tokio::test]
async fn revoked_local_file_degrades_without_failing_the_save() {
    let h = harness();
    h.registry
        .create_workspace(
            "Desk",
            WorkspaceOptions {
                enable_local: true,
                local_path: Some("desk.redstring".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    h.registry
        .switch_active_workspace("desk", SwitchOptions::default())
        .await
        .unwrap();

    let first = h.registry.save_active_workspace(&snapshot(&["a"])).await.unwrap();
    assert_eq!(first.saved, vec![Tier::Local, Tier::Cache]);

    // 3
    h.handles.handle("desk.redstring").revoke();
    let second = h
        .registry
        .save_active_workspace(&snapshot(&["a", "b"]))
        .await
        .unwrap();
    assert_eq!(second.saved, vec![Tier::Cache]);
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].tier, Tier::Local);
    assert_eq!(
        h.registry.get_active_workspace().unwrap().local_file.handle_status,
        HandleStatus::NeedsReconnect
    );
    assert!(h.sink.types().contains(&"tier_needs_reconnect"));

    // Later saves skip the tier instead of failing on it again.
    let third = h
        .registry
        .save_active_workspace(&snapshot(&["a", "b", "c"]))
        .await
        .unwrap();
    assert_eq!(third.skipped, vec![Tier::Local]);
    assert!(third.failed.is_empty());
    assert_eq!(h.handles.handle("desk.redstring").write_count(), 1);
}

#[tokio::test]
async fn repeated_force_save_is_idempotent_on_the_remote() {
    let h = harness();
    let ws = h
        .registry
        .create_workspace("Notes", remote_options(&h.repo))
        .unwrap();
    let path = ws.remote_path();
    let state = snapshot(&["x", "y"]);

    // 4
    h.registry.force_save("notes", &state).await.unwrap();
    let first = h.provider.content(&h.repo, &path).unwrap();
    let first_rev = h.provider.revision(&h.repo, &path).unwrap();

    h.registry.force_save("notes", &state).await.unwrap();
    let second = h.provider.content(&h.repo, &path).unwrap();
    let second_rev = h.provider.revision(&h.repo, &path).unwrap();

    assert_eq!(first, second);
    assert_ne!(first_rev, second_rev);
    assert!(h
        .provider
        .content(&h.repo, &format!("{}.backup", path))
        .is_some());
}

#[tokio::test]
async fn remote_wins_conflict_reads_before_writing_again() {
    let h = harness();
    let ws = h
        .registry
        .create_workspace("Shared", remote_options(&h.repo))
        .unwrap();
    let path = ws.remote_path();
    h.provider
        .put_file(&h.repo, &path, &document("Shared", &snapshot(&["theirs"])));
    h.provider.clear_ops();
    h.provider.fail_next_write(ScriptedFailure::Conflict);

    // 5
    let report = h
        .registry
        .force_save("shared", &snapshot(&["mine"]))
        .await
        .unwrap();
    assert!(report.reloaded_from_remote);

    let ops: Vec<ProviderOp> = h
        .provider
        .ops()
        .into_iter()
        .filter(|op| op.path() == path)
        .collect();
    let conflict_at = ops
        .iter()
        .position(|op| matches!(op, ProviderOp::WriteFile(_)))
        .unwrap();
    assert!(matches!(ops[conflict_at + 1], ProviderOp::ReadFile(_)));
    assert_eq!(h.provider.write_count(&path), 1);

    h.registry
        .switch_active_workspace("shared", SwitchOptions::default())
        .await
        .unwrap();
    assert!(h.registry.current_snapshot().nodes.contains("theirs"));
}

async fn empty_remote_scenario(policy: RemoteEmptyPolicy) -> GraphSnapshot {
    let mut config = RegistryConfig::for_state_dir("/unused");
    config.remote_empty_policy = policy;
    let h = harness_with(config);
    let ws = h
        .registry
        .create_workspace("Atlas", remote_options(&h.repo))
        .unwrap();
    h.registry
        .force_save("atlas", &snapshot(&["kept"]))
        .await
        .unwrap();
    h.provider.put_file(
        &h.repo,
        &ws.remote_path(),
        &document("Atlas", &GraphSnapshot::default()),
    );

    h.registry
        .switch_active_workspace("atlas", SwitchOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn empty_remote_keeps_populated_cache() {
    // 6
    let kept = empty_remote_scenario(RemoteEmptyPolicy::PreferCache).await;
    assert!(kept.nodes.contains("kept"));

    let trusted = empty_remote_scenario(RemoteEmptyPolicy::TrustRemote).await;
    assert!(trusted.is_empty());
}

#[tokio::test]
async fn workspace_list_survives_restart() {
    let dir = tempdir().unwrap();
    let handles = Arc::new(MemoryHandleFactory::new());
    let build = |sink: &MemorySink| {
        let events = Arc::new(EventDispatcher::new());
        events.add_sink(Box::new(sink.clone()));
        WorkspaceRegistry::builder(RegistryConfig::for_state_dir(dir.path()))
            .clock(ManualClock::starting_now())
            .events(events)
            .cache_backend(Arc::new(MemoryCacheBackend::new()))
            .handle_factory(handles.clone())
            .build()
            .unwrap()
    };

    // 7
    let first_sink = MemorySink::new();
    let first = build(&first_sink);
    first.initialize().await.unwrap();
    first
        .create_workspace(
            "Field Notes",
            WorkspaceOptions {
                enable_local: true,
                local_path: Some("field.redstring".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    first
        .switch_active_workspace("field-notes", SwitchOptions::default())
        .await
        .unwrap();
    drop(first);

    handles.handle("field.redstring").revoke();

    let sink = MemorySink::new();
    let second = build(&sink);
    second.initialize().await.unwrap();
    let slugs: Vec<String> = second
        .get_all_workspaces()
        .into_iter()
        .map(|w| w.slug)
        .collect();
    assert_eq!(slugs, vec!["universe", "field-notes"]);
    assert_eq!(second.active_slug(), "field-notes");
    assert_eq!(
        second.get_active_workspace().unwrap().local_file.handle_status,
        HandleStatus::NeedsReconnect
    );
    assert!(sink.types().contains(&"tier_needs_reconnect"));
    assert!(sink.types().contains(&"registry_ready"));

    // A second initialize is a no-op.
    sink.clear();
    second.initialize().await.unwrap();
    assert!(sink.events().is_empty());
}

/// A provider whose every call hangs.
struct StalledProvider;

#[async_trait]
impl RemoteProvider for StalledProvider {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn authenticate(&self) -> Result<AuthContext, StorageError> {
        std::future::pending().await
    }

    async fn is_available(&self) -> bool {
        std::future::pending().await
    }

    async fn repository_exists(&self, _repo: &RepoRef) -> Result<bool, StorageError> {
        std::future::pending().await
    }

    async fn read_file(&self, _repo: &RepoRef, _path: &str) -> Result<RemoteFile, StorageError> {
        std::future::pending().await
    }

    async fn file_revision(
        &self,
        _repo: &RepoRef,
        _path: &str,
    ) -> Result<Option<String>, StorageError> {
        std::future::pending().await
    }

    async fn write_file(
        &self,
        _repo: &RepoRef,
        _path: &str,
        _content: &str,
        _revision: Option<&str>,
    ) -> Result<String, StorageError> {
        std::future::pending().await
    }

    async fn list_directory(
        &self,
        _repo: &RepoRef,
        _path: &str,
    ) -> Result<Vec<DirEntry>, StorageError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_provider_cannot_block_initialize() {
    let dir = tempdir().unwrap();
    let repo = RepoRef::new("ada", "knowledge");
    let config = RegistryConfig::for_state_dir(dir.path());

    // Leave a remote-backed workspace active on disk.
    {
        let setup = WorkspaceRegistry::builder(config.clone())
            .clock(ManualClock::starting_now())
            .provider(Arc::new(MemoryProvider::new()))
            .cache_backend(Arc::new(MemoryCacheBackend::new()))
            .handle_factory(Arc::new(MemoryHandleFactory::new()))
            .build()
            .unwrap();
        setup
            .create_workspace("Remote", remote_options(&repo))
            .unwrap();
        setup
            .switch_active_workspace("remote", SwitchOptions::default())
            .await
            .unwrap();
    }

    // 8
    let sink = MemorySink::new();
    let events = Arc::new(EventDispatcher::new());
    events.add_sink(Box::new(sink.clone()));
    let registry = WorkspaceRegistry::builder(config)
        .clock(ManualClock::starting_now())
        .events(events)
        .provider(Arc::new(StalledProvider))
        .cache_backend(Arc::new(MemoryCacheBackend::new()))
        .handle_factory(Arc::new(MemoryHandleFactory::new()))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    registry.initialize().await.unwrap();
    assert!(started.elapsed() >= registry.config().init_timeout());
    assert!(registry.is_initialized().await);
    assert_eq!(registry.active_slug(), "remote");
    assert!(registry.current_snapshot().is_empty());
    assert!(sink.types().contains(&"registry_ready"));
    registry.shutdown();
}

#[tokio::test]
async fn discovery_accepts_content_under_any_shape() {
    let h = harness();
    h.provider.put_file(
        &h.repo,
        "universes/mixed/mixed.redstring",
        r#"{
            "metadata": {"title": ""},
            "prototypeSpace": {"prototypes": []},
            "legacy": {"nodePrototypes": {"n1": {"name": "Survivor"}}}
        }"#,
    );

    // 9
    let report = h
        .registry
        .discover_workspaces_in_repository(&h.repo)
        .await
        .unwrap();
    assert_eq!(report.stats.candidates, 1);
    assert_eq!(report.stats.valid, 1);
    assert_eq!(report.stats.invalid, 0);

    let found = &report.workspaces[0];
    assert_eq!(found.name, "mixed");
    assert_eq!(found.stats.node_count, 1);
    assert!(found.has_content);

    let ws = h.registry.link_discovered_workspace(found, &h.repo).unwrap();
    let loaded = h
        .registry
        .switch_active_workspace(&ws.slug, SwitchOptions::default())
        .await
        .unwrap();
    assert!(loaded.nodes.contains("n1"));
}

#[tokio::test]
async fn root_level_document_links_in_place() {
    let mut config = RegistryConfig::for_state_dir("/unused");
    config.discovery_root = String::new();
    let h = harness_with(config);
    h.provider
        .put_file(&h.repo, "notes.redstring", &document("", &snapshot(&["a"])));

    // 10
    let report = h
        .registry
        .discover_workspaces_in_repository(&h.repo)
        .await
        .unwrap();
    assert_eq!(report.workspaces.len(), 1);
    let found = &report.workspaces[0];
    assert_eq!(found.path, "notes.redstring");
    assert_eq!(found.folder, "");

    let ws = h.registry.link_discovered_workspace(found, &h.repo).unwrap();
    assert_eq!(ws.remote_path(), "notes.redstring");
    assert_eq!(
        h.registry.sync_engine(&ws.slug).unwrap().target().path,
        "notes.redstring"
    );

    h.registry
        .force_save(&ws.slug, &snapshot(&["a", "b"]))
        .await
        .unwrap();
    assert_eq!(h.provider.write_count("notes.redstring"), 1);
    assert!(h
        .provider
        .content(&h.repo, "universes/notes/notes.redstring")
        .is_none());
    let saved = h.provider.content(&h.repo, "notes.redstring").unwrap();
    assert!(saved.contains("\"b\""));
}
