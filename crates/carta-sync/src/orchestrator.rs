//! The incremental sync orchestrator.
//!
//! One run executes a fixed, ordered list of weighted sub-tasks against the
//! remote protocol: event-log sync, message sync, content sync per account,
//! then shared notebooks and shared notes. Each sub-task's weight is folded
//! into a monotone progress fraction persisted after the sub-task completes,
//! so an observer can read approximate completion at any time. Order is
//! significant; the weights assume it.
//!
//! Between sub-tasks the run passes explicit suspension points where the
//! cancellation token is checked, and every remote await races against the
//! token ([`interruptible`]). Cancellation is cooperative only; a sub-task
//! past its own suspension points runs to completion.
//!
//! Failure policy per sub-task: transient shared-resource failures are
//! swallowed (retried on the next scheduled run), auth failures route
//! through the token-refresh cache and get one retry, anything else aborts
//! the remainder of the run.

use std::future::Future;
use std::sync::Arc;

use carta_graph::{GraphStore, GraphTransaction, NodeRef, ProgressBucket};
use carta_storage::GraphStorage;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::{ActivityQueue, ActivityState, SyncActivity, SyncActivityType};
use crate::catchup::{self, CatchupRefs, CatchupTracker, ContainerType};
use crate::error::SyncError;
use crate::progress::{
    self, SyncProgressType, LAST_SYNC_START_TIME_PATH, LAST_SYNC_TIME_PATH,
};
use crate::protocol::{AccountKind, NodeDelta, RemoteProtocol, SyncUnit};
use crate::token::TokenRefreshCache;

const EVENT_LOG_SUBBUCKET_SIZE: f64 = 0.05;
const MESSAGE_SUBBUCKET_SIZE: f64 = 0.20;
const CONTENT_SUBBUCKET_SIZE: f64 = 0.35;
const SHARED_NOTEBOOKS_SUBBUCKET_SIZE: f64 = 0.20;
const SHARED_NOTES_SUBBUCKET_SIZE: f64 = 0.20;

pub const SHARING_SYNC_STATE_PATH: &str = "sharing";
pub const NOTESTORE_SYNC_STATE_KEY: &str = "notestore";

/// Failures the orchestrator reports but does not handle (exception
/// tracking collaborator).
pub type ExceptionSink = Arc<dyn Fn(&SyncError) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Present when the user also has a secondary vault/business account;
    /// the content weight is split between the two accounts.
    pub has_vault_account: bool,
    pub auth_token: String,
    pub user_id: String,
    /// TTL for refreshed tokens in the single-flight cache.
    pub token_ttl_ms: i64,
    /// Progress table this orchestrator reports into; `None` disables
    /// progress reporting for the run.
    pub progress_table: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            has_vault_account: false,
            auth_token: String::new(),
            user_id: String::new(),
            token_ttl_ms: 5 * 60 * 1000,
            progress_table: Some(progress::INITIAL_SYNC_PROGRESS_TABLE.to_string()),
        }
    }
}

/// Race a remote await against the cancellation token; whichever resolves
/// first decides whether the remainder of the run is abandoned.
pub async fn interruptible<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Interrupted),
        res = fut => res,
    }
}

pub struct SyncOrchestrator {
    storage: Arc<GraphStorage>,
    protocol: Arc<dyn RemoteProtocol>,
    queue: Arc<ActivityQueue>,
    tokens: TokenRefreshCache,
    config: SyncConfig,
    session_id: Uuid,
    exception_sink: Option<ExceptionSink>,
}

impl SyncOrchestrator {
    pub fn new(
        storage: Arc<GraphStorage>,
        protocol: Arc<dyn RemoteProtocol>,
        refresher: Arc<dyn crate::token::TokenRefresher>,
        queue: Arc<ActivityQueue>,
        config: SyncConfig,
    ) -> Self {
        let clock = storage.store().context().clock.clone();
        let tokens = TokenRefreshCache::new(refresher, clock, config.token_ttl_ms);
        Self {
            storage,
            protocol,
            queue,
            tokens,
            config,
            session_id: Uuid::new_v4(),
            exception_sink: None,
        }
    }

    pub fn with_exception_sink(mut self, sink: ExceptionSink) -> Self {
        self.exception_sink = Some(sink);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current progress snapshot for observers.
    pub fn progress(&self) -> progress::ProgressSnapshot {
        progress::progress_snapshot(&self.storage.store(), self.queue.is_disabled(), None)
    }

    // ========================================================================
    // Run state machine
    // ========================================================================

    /// Execute one activity and record its terminal state on the queue.
    /// `Queued → Running` happened when the queue handed the activity out.
    pub async fn run(&self, activity: &SyncActivity, cancel: &CancellationToken) -> ActivityState {
        let result = match activity.activity_type {
            SyncActivityType::IncrementalSync => self.run_incremental(activity, cancel).await,
            SyncActivityType::CatchupSync => self.run_catchup(activity, cancel).await,
        };

        let state = match result {
            Ok(()) => ActivityState::Completed,
            Err(SyncError::Interrupted) => {
                tracing::debug!(activity = ?activity.activity_type, "run interrupted");
                ActivityState::Retryable
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(activity = ?activity.activity_type, error = %err, "run will retry");
                ActivityState::Retryable
            }
            Err(err) => {
                tracing::error!(activity = ?activity.activity_type, error = %err, "run failed");
                if let Some(sink) = &self.exception_sink {
                    sink(&err);
                }
                ActivityState::Failed
            }
        };
        self.queue.finish(activity.id, state);
        state
    }

    async fn run_incremental(
        &self,
        activity: &SyncActivity,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let store = self.storage.store();
        if self.config.progress_table.is_some() {
            progress::update_sync_progress_type(&store, SyncProgressType::IncrementalSync)?;
        }
        let result = self.run_incremental_inner(&store, activity, cancel).await;
        if self.config.progress_table.is_some() {
            progress::clear_sync_progress(&store)?;
        }
        result
    }

    async fn run_incremental_inner(
        &self,
        store: &Arc<GraphStore>,
        activity: &SyncActivity,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let sync_start_time = store.context().clock.now_ms();
        let mut offset = 0.0;

        // Order matters: weights and offsets assume this sequence.
        self.yield_check(cancel)?;
        let unit = interruptible(cancel, self.protocol.sync_event_log()).await?;
        self.apply_unit(store, "eventLog", &unit, None)?;
        offset += EVENT_LOG_SUBBUCKET_SIZE;
        self.set_progress(store, activity, offset)?;

        self.yield_check(cancel)?;
        let unit = interruptible(cancel, self.protocol.sync_messages()).await?;
        self.apply_unit(store, "messages", &unit, None)?;
        offset += MESSAGE_SUBBUCKET_SIZE;
        self.set_progress(store, activity, offset)?;

        let content_bucket = if self.config.has_vault_account {
            CONTENT_SUBBUCKET_SIZE / 2.0
        } else {
            CONTENT_SUBBUCKET_SIZE
        };
        self.yield_check(cancel)?;
        self.sync_content_account(store, activity, AccountKind::Personal, content_bucket, &mut offset, cancel)
            .await?;
        if self.config.has_vault_account {
            self.yield_check(cancel)?;
            self.sync_content_account(store, activity, AccountKind::Vault, content_bucket, &mut offset, cancel)
                .await?;
        }

        self.yield_check(cancel)?;
        for guid in shared_guids(store, "sharedNotebooks") {
            self.yield_check(cancel)?;
            if let Err(err) = self.sync_shared(store, &guid, SharedKind::Notebook, cancel).await {
                if err.is_transient() {
                    tracing::warn!(guid = %guid, error = %err, "shared notebook sync deferred");
                } else {
                    return Err(err);
                }
            }
        }
        offset += SHARED_NOTEBOOKS_SUBBUCKET_SIZE;
        self.set_progress(store, activity, offset)?;

        for guid in shared_guids(store, "sharedNotes") {
            self.yield_check(cancel)?;
            if let Err(err) = self.sync_shared(store, &guid, SharedKind::Note, cancel).await {
                if err.is_transient() {
                    tracing::warn!(guid = %guid, error = %err, "shared note sync deferred");
                } else {
                    return Err(err);
                }
            }
        }
        offset += SHARED_NOTES_SUBBUCKET_SIZE;
        self.set_progress(store, activity, offset)?;

        let now = store.context().clock.now_ms();
        store.transact("updateSyncTime", |tx| {
            tx.replace_sync_state(&[LAST_SYNC_TIME_PATH], json!(now));
            tx.replace_sync_state(&[LAST_SYNC_START_TIME_PATH], json!(sync_start_time));
            Ok(())
        })?;
        self.set_progress(store, activity, 1.0)?;

        self.storage.flush().map_err(|e| SyncError::Hard(e.to_string()))?;
        Ok(())
    }

    // ========================================================================
    // Sub-tasks
    // ========================================================================

    async fn sync_content_account(
        &self,
        store: &Arc<GraphStore>,
        activity: &SyncActivity,
        account: AccountKind,
        bucket: f64,
        offset: &mut f64,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let sync_context = account.sync_context();
        let remote_count =
            interruptible(cancel, self.protocol.content_update_count(account)).await?;
        let local_count = store
            .get_sync_state(&[sync_context, NOTESTORE_SYNC_STATE_KEY])
            .and_then(|v| v.get("lastUpdateCount").and_then(|c| c.as_i64()))
            .unwrap_or(0);

        if remote_count == local_count {
            tracing::debug!(context = sync_context, count = remote_count, "content up to date");
            *offset += bucket;
            self.set_progress(store, activity, *offset)?;
            return Ok(());
        }

        let content = interruptible(cancel, self.protocol.sync_content(account)).await?;
        let catchup_refs = (!content.catchup_refs.is_empty()).then_some(&content.catchup_refs);
        self.apply_unit(store, sync_context, &content.unit, catchup_refs)?;

        // Containers the cursor could not confirm get a follow-up pass
        // instead of blocking this run.
        let tracker = CatchupTracker::new(store.clone());
        if !tracker.state()?.is_empty() && !self.queue.has_queued(SyncActivityType::CatchupSync) {
            let now = store.context().clock.now_ms();
            self.queue.enqueue(
                SyncActivity::new(
                    SyncActivityType::CatchupSync,
                    activity.priority,
                    activity.subpriority,
                    now,
                )
                .run_after(now),
            );
        }

        *offset += bucket;
        self.set_progress(store, activity, *offset)?;
        Ok(())
    }

    async fn sync_shared(
        &self,
        store: &Arc<GraphStore>,
        guid: &str,
        kind: SharedKind,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let unit = match self.call_shared(guid, kind, cancel).await {
            Ok(unit) => unit,
            Err(err) if err.is_auth() => {
                tracing::debug!(guid = %guid, "auth failure, refreshing token");
                self.tokens
                    .invalidate(&self.config.auth_token, &self.config.user_id);
                self.tokens
                    .refresh(&self.config.auth_token, &self.config.user_id)
                    .await?;
                // One retry with the fresh token; a second failure is fatal.
                self.call_shared(guid, kind, cancel).await?
            }
            Err(err) => return Err(err),
        };
        self.apply_unit(store, &kind.sync_context(guid), &unit, None)
    }

    async fn call_shared(
        &self,
        guid: &str,
        kind: SharedKind,
        cancel: &CancellationToken,
    ) -> Result<SyncUnit, SyncError> {
        match kind {
            SharedKind::Notebook => {
                interruptible(cancel, self.protocol.sync_shared_notebook(guid)).await
            }
            SharedKind::Note => interruptible(cancel, self.protocol.sync_shared_note(guid)).await,
        }
    }

    // ========================================================================
    // Catch-up
    // ========================================================================

    async fn run_catchup(
        &self,
        _activity: &SyncActivity,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let store = self.storage.store();
        let tracker = CatchupTracker::new(store.clone());
        let state = tracker.state()?;

        for guid in &state.guids.notebooks {
            self.yield_check(cancel)?;
            self.catchup_one(&store, ContainerType::Notebook, guid, cancel)
                .await?;
        }
        for guid in &state.guids.workspaces {
            self.yield_check(cancel)?;
            self.catchup_one(&store, ContainerType::Workspace, guid, cancel)
                .await?;
        }

        tracing::debug!(
            notebook_floor = tracker.min_last_update_count(ContainerType::Notebook)?,
            workspace_floor = tracker.min_last_update_count(ContainerType::Workspace)?,
            "catch-up pass finished"
        );
        self.storage.flush().map_err(|e| SyncError::Hard(e.to_string()))?;
        Ok(())
    }

    async fn catchup_one(
        &self,
        store: &Arc<GraphStore>,
        container_type: ContainerType,
        guid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let type_name = match container_type {
            ContainerType::Notebook => "Notebook",
            ContainerType::Workspace => "Workspace",
        };
        match interruptible(cancel, self.protocol.catchup_container(type_name, guid)).await {
            Ok(unit) => {
                // Watermark update and removal commit with the deltas, so the
                // tracked set and the graph can never disagree.
                let guids = vec![guid.to_string()];
                let refs = match container_type {
                    ContainerType::Notebook => CatchupRefs {
                        notebooks: guids.clone(),
                        ..Default::default()
                    },
                    ContainerType::Workspace => CatchupRefs {
                        workspaces: guids.clone(),
                        ..Default::default()
                    },
                };
                store.transact("applyCatchup", |tx| {
                    for delta in &unit.deltas {
                        apply_delta(tx, delta)?;
                    }
                    catchup::set_last_update_count_in_tx(
                        tx,
                        container_type,
                        &guids,
                        unit.last_update_count,
                    )
                    .map_err(to_graph_err)?;
                    catchup::remove_in_tx(tx, &refs).map_err(to_graph_err)?;
                    Ok(())
                })?;
                Ok(())
            }
            Err(err) if err.is_transient() => {
                // Stays tracked; its low watermark keeps the cursor floor
                // from advancing past it.
                tracing::warn!(guid = %guid, error = %err, "catch-up deferred");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn yield_check(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Persist one unit's deltas, its cursor, and any catch-up registrations
    /// in a single transaction.
    fn apply_unit(
        &self,
        store: &GraphStore,
        sync_context: &str,
        unit: &SyncUnit,
        catchup_refs: Option<&CatchupRefs>,
    ) -> Result<(), SyncError> {
        store.transact("applySyncUnit", |tx| {
            for delta in &unit.deltas {
                apply_delta(tx, delta)?;
            }
            tx.update_sync_state(
                &[sync_context, NOTESTORE_SYNC_STATE_KEY],
                json!({ "lastUpdateCount": unit.last_update_count }),
            );
            if let Some(refs) = catchup_refs {
                catchup::add_in_tx(tx, refs).map_err(to_graph_err)?;
            }
            Ok(())
        })?;
        tracing::debug!(
            context = sync_context,
            deltas = unit.deltas.len(),
            cursor = unit.last_update_count,
            session = %self.session_id,
            "sync unit applied"
        );
        Ok(())
    }

    fn set_progress(
        &self,
        store: &GraphStore,
        activity: &SyncActivity,
        fraction: f64,
    ) -> Result<(), SyncError> {
        let Some(table) = &self.config.progress_table else {
            return Ok(());
        };
        let now = store.context().clock.now_ms();
        let key = activity.id.to_string();
        store.transact("setSyncProgress", |tx| {
            let start_time = tx
                .get_progress(table, &key)
                .and_then(|b| b.start_time)
                .or(Some(now));
            tx.put_progress(
                table,
                &key,
                ProgressBucket {
                    total_size: Some(activity.progress_bucket_size()),
                    percent_complete: fraction,
                    start_time,
                    end_time: (fraction >= 1.0).then_some(now),
                },
            );
            Ok(())
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SharedKind {
    Notebook,
    Note,
}

impl SharedKind {
    fn sync_context(self, guid: &str) -> String {
        match self {
            SharedKind::Notebook => format!("sharedNotebook:{guid}"),
            SharedKind::Note => format!("sharedNote:{guid}"),
        }
    }
}

/// Guids registered under `["sharing"]` for one shared-resource kind.
fn shared_guids(store: &GraphStore, kind_key: &str) -> Vec<String> {
    store
        .get_sync_state(&[SHARING_SYNC_STATE_PATH])
        .and_then(|v| {
            v.get(kind_key)
                .and_then(|m| m.as_object().map(|o| o.keys().cloned().collect()))
        })
        .unwrap_or_default()
}

fn apply_delta(tx: &mut GraphTransaction, delta: &NodeDelta) -> Result<(), carta_graph::GraphError> {
    match delta {
        NodeDelta::Upsert {
            node_type,
            id,
            fields,
        } => {
            let nref = NodeRef::new(node_type, id);
            if tx.get_node(&nref).is_some() {
                tx.update_fields(&nref, fields.clone())?;
            } else {
                tx.create_node(node_type, id, fields.clone())?;
            }
        }
        NodeDelta::Delete { node_type, id } => {
            let nref = NodeRef::new(node_type, id);
            // Remote deletes of locally-unknown nodes are a no-op.
            if tx.get_node(&nref).is_some() {
                tx.delete_node(&nref)?;
            }
        }
        NodeDelta::AddEdge {
            edge,
            src_type,
            src_id,
            dst_type,
            dst_id,
        } => {
            tx.add_edge(
                edge,
                &NodeRef::new(src_type, src_id),
                &NodeRef::new(dst_type, dst_id),
            )?;
        }
        NodeDelta::RemoveEdge {
            edge,
            src_type,
            src_id,
            dst_type,
            dst_id,
        } => {
            tx.remove_edge(
                edge,
                &NodeRef::new(src_type, src_id),
                &NodeRef::new(dst_type, dst_id),
            )?;
        }
    }
    Ok(())
}

fn to_graph_err(err: SyncError) -> carta_graph::GraphError {
    carta_graph::GraphError::Serialization(err.to_string())
}
