//! End-to-end orchestrator tests against a scripted remote protocol.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use carta_graph::{
    EntitySchema, FieldKind, FieldValue, GraphContext, GraphStore, NodeRef, SchemaRegistry,
};
use carta_storage::{GraphStorage, StorageConfig};
use carta_sync::{
    interruptible, ActivityQueue, ActivityState, CatchupRefs, CatchupTracker, ContainerType,
    ContentUnit, NodeDelta, RemoteProtocol, SyncActivity, SyncActivityPriority, SyncActivityType,
    SyncConfig, SyncError, SyncOrchestrator, SyncUnit, TokenRefresher,
    BACKGROUND_SYNC_PROGRESS_TABLE,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted collaborators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailKind {
    Transient,
    Auth,
    Hard,
}

fn make_err(kind: FailKind) -> SyncError {
    match kind {
        FailKind::Transient => SyncError::Transient("try again later".to_string()),
        FailKind::Auth => SyncError::Auth("token expired".to_string()),
        FailKind::Hard => SyncError::Hard("remote exploded".to_string()),
    }
}

#[derive(Default)]
struct MockProtocol {
    /// Set after the store exists so calls can sample live progress.
    store: Mutex<Option<Arc<GraphStore>>>,
    calls: Mutex<Vec<String>>,
    /// Progress fraction observed at the start of each call.
    observed: Mutex<Vec<(String, f64)>>,
    event_log_deltas: Mutex<Vec<NodeDelta>>,
    messages_fail: Mutex<Option<FailKind>>,
    remote_content_count: AtomicI64,
    content_catchup: Mutex<Option<CatchupRefs>>,
    /// Failures popped per shared guid, in order; empty means success.
    shared_fails: Mutex<HashMap<String, VecDeque<FailKind>>>,
    catchup_count: AtomicI64,
    cancel_on_messages: Mutex<Option<CancellationToken>>,
}

impl MockProtocol {
    fn attach(&self, store: Arc<GraphStore>) {
        *self.store.lock() = Some(store);
    }

    fn record(&self, name: &str) {
        let fraction = self
            .store
            .lock()
            .as_ref()
            .and_then(|store| {
                let keys = store.progress_keys(BACKGROUND_SYNC_PROGRESS_TABLE);
                let key = keys.first()?;
                store
                    .get_progress(BACKGROUND_SYNC_PROGRESS_TABLE, key)
                    .map(|b| b.percent_complete)
            })
            .unwrap_or(0.0);
        self.calls.lock().push(name.to_string());
        self.observed.lock().push((name.to_string(), fraction));
    }

    fn call_names(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RemoteProtocol for MockProtocol {
    async fn content_update_count(&self, account: carta_sync::AccountKind) -> Result<i64, SyncError> {
        self.record(&format!("count:{}", account.sync_context()));
        Ok(self.remote_content_count.load(Ordering::SeqCst))
    }

    async fn sync_event_log(&self) -> Result<SyncUnit, SyncError> {
        self.record("eventLog");
        Ok(SyncUnit {
            deltas: self.event_log_deltas.lock().clone(),
            last_update_count: 1,
        })
    }

    async fn sync_messages(&self) -> Result<SyncUnit, SyncError> {
        self.record("messages");
        if let Some(token) = self.cancel_on_messages.lock().take() {
            token.cancel();
        }
        if let Some(kind) = self.messages_fail.lock().take() {
            return Err(make_err(kind));
        }
        Ok(SyncUnit::default())
    }

    async fn sync_content(&self, account: carta_sync::AccountKind) -> Result<ContentUnit, SyncError> {
        self.record(&format!("content:{}", account.sync_context()));
        Ok(ContentUnit {
            unit: SyncUnit {
                deltas: Vec::new(),
                last_update_count: self.remote_content_count.load(Ordering::SeqCst),
            },
            catchup_refs: self.content_catchup.lock().clone().unwrap_or_default(),
        })
    }

    async fn sync_shared_notebook(&self, guid: &str) -> Result<SyncUnit, SyncError> {
        self.record(&format!("sharedNotebook:{guid}"));
        match self.shared_fails.lock().get_mut(guid).and_then(|q| q.pop_front()) {
            Some(kind) => Err(make_err(kind)),
            None => Ok(SyncUnit::default()),
        }
    }

    async fn sync_shared_note(&self, guid: &str) -> Result<SyncUnit, SyncError> {
        self.record(&format!("sharedNote:{guid}"));
        match self.shared_fails.lock().get_mut(guid).and_then(|q| q.pop_front()) {
            Some(kind) => Err(make_err(kind)),
            None => Ok(SyncUnit::default()),
        }
    }

    async fn catchup_container(
        &self,
        container_type: &str,
        guid: &str,
    ) -> Result<SyncUnit, SyncError> {
        self.record(&format!("catchup:{container_type}:{guid}"));
        Ok(SyncUnit {
            deltas: Vec::new(),
            last_update_count: self.catchup_count.load(Ordering::SeqCst),
        })
    }
}

struct MockRefresher {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    async fn refresh(&self, _token: &str, _user_id: &str) -> Result<String, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("fresh-token".to_string())
    }
}

// ============================================================================
// World setup
// ============================================================================

fn schema_ctx() -> GraphContext {
    let schema = SchemaRegistry::new(vec![
        EntitySchema::new("Note")
            .field("label", FieldKind::Str)
            .nullable_field("notebook", FieldKind::Id),
        EntitySchema::new("Notebook").field("label", FieldKind::Str),
        EntitySchema::new("Workspace").field("label", FieldKind::Str),
    ])
    .unwrap();
    GraphContext::new(Arc::new(schema))
}

struct World {
    storage: Arc<GraphStorage>,
    store: Arc<GraphStore>,
    protocol: Arc<MockProtocol>,
    refresher: Arc<MockRefresher>,
    queue: Arc<ActivityQueue>,
    orchestrator: SyncOrchestrator,
    _dir: tempfile::TempDir,
}

fn world_with(config: SyncConfig) -> World {
    let dir = tempdir().unwrap();
    let storage_config = StorageConfig {
        graph_path: dir.path().join("graph.crtg"),
        changelog_path: dir.path().join("changelog.json"),
        max_pending: 100,
    };
    let storage = Arc::new(GraphStorage::new(schema_ctx(), storage_config).unwrap());
    let store = storage.store();

    let protocol = Arc::new(MockProtocol::default());
    protocol.attach(store.clone());
    let refresher = Arc::new(MockRefresher {
        calls: AtomicUsize::new(0),
    });
    let queue = Arc::new(ActivityQueue::new(store.context().clock.clone()));
    let orchestrator = SyncOrchestrator::new(
        storage.clone(),
        protocol.clone(),
        refresher.clone(),
        queue.clone(),
        config,
    );

    World {
        storage,
        store,
        protocol,
        refresher,
        queue,
        orchestrator,
        _dir: dir,
    }
}

fn world() -> World {
    world_with(SyncConfig {
        auth_token: "token".to_string(),
        user_id: "user".to_string(),
        progress_table: Some(BACKGROUND_SYNC_PROGRESS_TABLE.to_string()),
        ..Default::default()
    })
}

fn incremental_activity(world: &World) -> SyncActivity {
    let now = world.store.context().clock.now_ms();
    let activity = SyncActivity::new(
        SyncActivityType::IncrementalSync,
        SyncActivityPriority::Immediate,
        0,
        now,
    );
    world.queue.enqueue(activity.clone());
    world.queue.next_ready().expect("activity should be ready")
}

fn add_shared_notebook(world: &World, guid: &str) {
    world
        .store
        .transact("registerShare", |tx| {
            tx.update_sync_state(
                &["sharing"],
                json!({ "sharedNotebooks": { guid: { "authStr": "s" } } }),
            );
            Ok(())
        })
        .unwrap();
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

fn add_shared_note(world: &World, guid: &str) {
    world
        .store
        .transact("registerShare", |tx| {
            tx.update_sync_state(
                &["sharing"],
                json!({ "sharedNotes": { guid: { "authStr": "s" } } }),
            );
            Ok(())
        })
        .unwrap();
}

// ============================================================================
// Weighted progress
// ============================================================================

#[tokio::test]
async fn test_progress_follows_subtask_weights() {
    let world = world();
    world.protocol.remote_content_count.store(10, Ordering::SeqCst);
    add_shared_notebook(&world, "sn1");

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Completed);

    // Each sub-task observes the cumulative weight of everything before it.
    let observed: HashMap<String, f64> = world.protocol.observed.lock().clone().into_iter().collect();
    assert_close(observed["eventLog"], 0.0);
    assert_close(observed["messages"], 0.05);
    assert_close(observed["count:personal"], 0.25);
    assert_close(observed["sharedNotebook:sn1"], 0.60);

    // The bucket terminates at 1.0 after the final transactional commit.
    let keys = world.store.progress_keys(BACKGROUND_SYNC_PROGRESS_TABLE);
    let bucket = world
        .store
        .get_progress(BACKGROUND_SYNC_PROGRESS_TABLE, &keys[0])
        .unwrap();
    assert_eq!(bucket.percent_complete, 1.0);
    assert!(bucket.end_time.is_some());
}

#[tokio::test]
async fn test_vault_account_splits_content_weight() {
    let world = world_with(SyncConfig {
        has_vault_account: true,
        auth_token: "token".to_string(),
        user_id: "user".to_string(),
        progress_table: Some(BACKGROUND_SYNC_PROGRESS_TABLE.to_string()),
        ..Default::default()
    });
    world.protocol.remote_content_count.store(10, Ordering::SeqCst);
    add_shared_note(&world, "note1");

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Completed);

    let observed: HashMap<String, f64> = world.protocol.observed.lock().clone().into_iter().collect();
    // Second account starts at 0.25 + 0.175.
    assert_close(observed["count:vault"], 0.425);
    // Shared notes run after both content passes and shared notebooks.
    assert_close(observed["sharedNote:note1"], 0.80);
}

// ============================================================================
// Delta application and cursors
// ============================================================================

#[tokio::test]
async fn test_deltas_and_sync_times_are_persisted() {
    let world = world();
    let mut fields = BTreeMap::new();
    fields.insert("label".to_string(), FieldValue::from("Pulled"));
    fields.insert("notebook".to_string(), FieldValue::Null);
    world.protocol.event_log_deltas.lock().push(NodeDelta::Upsert {
        node_type: "Note".to_string(),
        id: "n1".to_string(),
        fields,
    });
    world.protocol.remote_content_count.store(3, Ordering::SeqCst);

    let before = world.store.context().clock.now_ms();
    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Completed);

    let node = world.store.get_node(&NodeRef::new("Note", "n1")).unwrap();
    assert_eq!(node.field("label"), Some(&FieldValue::from("Pulled")));

    // Cursor advanced transactionally with the content pass.
    let cursor = world
        .store
        .get_sync_state(&["personal", "notestore"])
        .unwrap();
    assert_eq!(cursor["lastUpdateCount"], 3);

    let last_sync = world
        .store
        .get_sync_state(&["lastSyncTime"])
        .and_then(|v| v.as_i64())
        .unwrap();
    let last_start = world
        .store
        .get_sync_state(&["lastSyncStartTime"])
        .and_then(|v| v.as_i64())
        .unwrap();
    assert!(last_start >= before);
    assert!(last_sync >= last_start);

    // The run flushed a snapshot to disk.
    assert!(world.storage.config().graph_path.exists());
}

#[tokio::test]
async fn test_content_pass_skipped_when_cursor_matches() {
    let world = world();
    world
        .store
        .transact("seedCursor", |tx| {
            tx.update_sync_state(&["personal", "notestore"], json!({ "lastUpdateCount": 42 }));
            Ok(())
        })
        .unwrap();
    world.protocol.remote_content_count.store(42, Ordering::SeqCst);

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Completed);

    let calls = world.protocol.call_names();
    assert!(calls.contains(&"count:personal".to_string()));
    assert!(
        !calls.iter().any(|c| c == "content:personal"),
        "unchanged remote cursor must skip the content pass: {calls:?}"
    );
}

// ============================================================================
// Failure classification
// ============================================================================

#[tokio::test]
async fn test_transient_shared_failure_does_not_abort_run() {
    let world = world();
    world
        .store
        .transact("registerShares", |tx| {
            tx.update_sync_state(
                &["sharing"],
                json!({
                    "sharedNotebooks": { "bad": {}, "good": {} }
                }),
            );
            Ok(())
        })
        .unwrap();
    world
        .protocol
        .shared_fails
        .lock()
        .insert("bad".to_string(), VecDeque::from([FailKind::Transient]));

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;

    assert_eq!(state, ActivityState::Completed);
    let calls = world.protocol.call_names();
    assert!(calls.contains(&"sharedNotebook:bad".to_string()));
    assert!(calls.contains(&"sharedNotebook:good".to_string()));
}

#[tokio::test]
async fn test_hard_failure_aborts_remaining_subtasks() {
    let world = world();
    *world.protocol.messages_fail.lock() = Some(FailKind::Hard);
    let sink_hits = Arc::new(AtomicUsize::new(0));
    let hits = sink_hits.clone();
    let orchestrator = SyncOrchestrator::new(
        world.storage.clone(),
        world.protocol.clone(),
        world.refresher.clone(),
        world.queue.clone(),
        SyncConfig {
            auth_token: "token".to_string(),
            user_id: "user".to_string(),
            progress_table: None,
            ..Default::default()
        },
    )
    .with_exception_sink(Arc::new(move |_err| {
        hits.fetch_add(1, Ordering::SeqCst);
    }));

    let activity = incremental_activity(&world);
    let state = orchestrator.run(&activity, &CancellationToken::new()).await;

    assert_eq!(state, ActivityState::Failed);
    assert_eq!(sink_hits.load(Ordering::SeqCst), 1);
    let calls = world.protocol.call_names();
    assert!(calls.contains(&"messages".to_string()));
    assert!(
        !calls.iter().any(|c| c.starts_with("count:")),
        "content must not run after a hard failure: {calls:?}"
    );

    // A fresh queued attempt is scheduled per retry rules.
    assert_eq!(world.queue.queued_len(), 1);
}

#[tokio::test]
async fn test_auth_failure_refreshes_token_then_retries_once() {
    let world = world();
    add_shared_note(&world, "locked");
    world
        .protocol
        .shared_fails
        .lock()
        .insert("locked".to_string(), VecDeque::from([FailKind::Auth]));

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;

    assert_eq!(state, ActivityState::Completed);
    assert_eq!(world.refresher.calls.load(Ordering::SeqCst), 1);
    let calls = world.protocol.call_names();
    let attempts = calls.iter().filter(|c| *c == "sharedNote:locked").count();
    assert_eq!(attempts, 2, "one retry after token refresh");
}

#[tokio::test]
async fn test_second_auth_failure_is_fatal() {
    let world = world();
    add_shared_note(&world, "locked");
    world.protocol.shared_fails.lock().insert(
        "locked".to_string(),
        VecDeque::from([FailKind::Auth, FailKind::Auth]),
    );

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Failed);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_stops_at_next_suspension_point() {
    let world = world();
    let cancel = CancellationToken::new();
    *world.protocol.cancel_on_messages.lock() = Some(cancel.clone());

    let activity = incremental_activity(&world);
    let state = world.orchestrator.run(&activity, &cancel).await;

    assert_eq!(state, ActivityState::Retryable);
    let calls = world.protocol.call_names();
    assert!(calls.contains(&"messages".to_string()));
    assert!(
        !calls.iter().any(|c| c.starts_with("count:")),
        "no sub-task may start after cancellation: {calls:?}"
    );
}

#[tokio::test]
async fn test_interruptible_races_inflight_work() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = interruptible(&cancel, async {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok::<_, SyncError>(1)
    })
    .await;
    assert!(matches!(res, Err(SyncError::Interrupted)));

    let res = interruptible(&CancellationToken::new(), async { Ok::<_, SyncError>(7) }).await;
    assert_eq!(res.unwrap(), 7);
}

// ============================================================================
// Catch-up
// ============================================================================

#[tokio::test]
async fn test_content_registers_catchup_and_enqueues_followup() {
    let world = world();
    world.protocol.remote_content_count.store(5, Ordering::SeqCst);
    *world.protocol.content_catchup.lock() = Some(CatchupRefs {
        notebooks: vec!["moved-nb".to_string()],
        workspaces: vec![],
    });

    let activity = incremental_activity(&world);
    let state = world
        .orchestrator
        .run(&activity, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Completed);

    let tracker = CatchupTracker::new(world.store.clone());
    let catchup_state = tracker.state().unwrap();
    assert_eq!(catchup_state.guids.notebooks, vec!["moved-nb".to_string()]);
    assert_eq!(
        tracker.min_last_update_count(ContainerType::Notebook).unwrap(),
        0
    );
    assert!(world.queue.has_queued(SyncActivityType::CatchupSync));

    // Run the follow-up pass; it verifies the container and untracks it.
    world.protocol.catchup_count.store(9, Ordering::SeqCst);
    let followup = world.queue.next_ready().unwrap();
    assert_eq!(followup.activity_type, SyncActivityType::CatchupSync);
    let state = world
        .orchestrator
        .run(&followup, &CancellationToken::new())
        .await;
    assert_eq!(state, ActivityState::Completed);

    assert!(tracker.state().unwrap().is_empty());
    assert!(world
        .protocol
        .call_names()
        .contains(&"catchup:Notebook:moved-nb".to_string()));
}
