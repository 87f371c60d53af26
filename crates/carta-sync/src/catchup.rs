//! Catch-up tracking.
//!
//! Containers the incremental cursor cannot safely confirm (moved or merged
//! notebooks/workspaces) are parked here with a per-container watermark. A
//! later catch-up pass re-verifies them out of band; until every tracked
//! container's watermark passes a remote cursor value, that cursor must not
//! be pruned, which is what [`CatchupTracker::min_last_update_count`] feeds.
//!
//! State lives in sync state under `["catchupRefs"]`. Every mutation is a
//! read-modify-write against the latest persisted state, inside the same
//! transaction as the sync step that triggered it; nothing is cached across
//! transaction boundaries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use carta_graph::{GraphStore, GraphTransaction};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const CATCHUP_SYNC_STATE_PATH: &str = "catchupRefs";

/// Container kinds tracked for catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    Notebook,
    Workspace,
}

/// Container ids grouped by kind, as handed over by a content sub-task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchupRefs {
    pub notebooks: Vec<String>,
    pub workspaces: Vec<String>,
}

impl CatchupRefs {
    pub fn is_empty(&self) -> bool {
        self.notebooks.is_empty() && self.workspaces.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchupGuids {
    pub notebooks: Vec<String>,
    pub workspaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchupCounts {
    pub notebooks: BTreeMap<String, i64>,
    pub workspaces: BTreeMap<String, i64>,
}

/// Persisted catch-up state. Invariant: every id in `guids` has an entry in
/// `last_update_counts`; ids are removed from both sides together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchupState {
    pub guids: CatchupGuids,
    pub last_update_counts: CatchupCounts,
}

impl CatchupState {
    pub fn is_empty(&self) -> bool {
        self.guids.notebooks.is_empty() && self.guids.workspaces.is_empty()
    }
}

// ============================================================================
// Transaction-level operations
// ============================================================================

pub fn get_state(tx: &GraphTransaction) -> Result<CatchupState, SyncError> {
    match tx.get_sync_state(&[CATCHUP_SYNC_STATE_PATH]) {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(CatchupState::default()),
    }
}

fn put_state(tx: &mut GraphTransaction, state: &CatchupState) -> Result<(), SyncError> {
    tx.replace_sync_state(&[CATCHUP_SYNC_STATE_PATH], serde_json::to_value(state)?);
    Ok(())
}

/// Union `refs` into the tracked set, initializing new watermarks to 0.
/// Idempotent.
pub fn add_in_tx(tx: &mut GraphTransaction, refs: &CatchupRefs) -> Result<(), SyncError> {
    let state = get_state(tx)?;
    let mut counts = state.last_update_counts;
    let mut notebooks: BTreeSet<String> = state.guids.notebooks.into_iter().collect();
    let mut workspaces: BTreeSet<String> = state.guids.workspaces.into_iter().collect();

    for guid in &refs.notebooks {
        notebooks.insert(guid.clone());
        counts.notebooks.entry(guid.clone()).or_insert(0);
    }
    for guid in &refs.workspaces {
        workspaces.insert(guid.clone());
        counts.workspaces.entry(guid.clone()).or_insert(0);
    }

    put_state(
        tx,
        &CatchupState {
            guids: CatchupGuids {
                notebooks: notebooks.into_iter().collect(),
                workspaces: workspaces.into_iter().collect(),
            },
            last_update_counts: counts,
        },
    )
}

/// Remove processed ids from both the tracked set and the watermarks.
/// Removing a non-member is a no-op.
pub fn remove_in_tx(tx: &mut GraphTransaction, refs: &CatchupRefs) -> Result<(), SyncError> {
    let state = get_state(tx)?;
    let mut counts = state.last_update_counts;
    let mut notebooks: BTreeSet<String> = state.guids.notebooks.into_iter().collect();
    let mut workspaces: BTreeSet<String> = state.guids.workspaces.into_iter().collect();

    for guid in &refs.notebooks {
        notebooks.remove(guid);
        counts.notebooks.remove(guid);
    }
    for guid in &refs.workspaces {
        workspaces.remove(guid);
        counts.workspaces.remove(guid);
    }

    put_state(
        tx,
        &CatchupState {
            guids: CatchupGuids {
                notebooks: notebooks.into_iter().collect(),
                workspaces: workspaces.into_iter().collect(),
            },
            last_update_counts: counts,
        },
    )
}

/// Overwrite the watermark for each listed id.
pub fn set_last_update_count_in_tx(
    tx: &mut GraphTransaction,
    container_type: ContainerType,
    guids: &[String],
    count: i64,
) -> Result<(), SyncError> {
    let mut state = get_state(tx)?;
    let counts = match container_type {
        ContainerType::Notebook => &mut state.last_update_counts.notebooks,
        ContainerType::Workspace => &mut state.last_update_counts.workspaces,
    };
    for guid in guids {
        counts.insert(guid.clone(), count);
    }
    put_state(tx, &state)
}

// ============================================================================
// Tracker
// ============================================================================

/// Store-level handle; each method runs its own transaction. Sub-tasks that
/// need to combine catch-up mutations with delta writes use the `_in_tx`
/// functions inside their own transaction instead.
pub struct CatchupTracker {
    store: Arc<GraphStore>,
}

impl CatchupTracker {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    pub fn state(&self) -> Result<CatchupState, SyncError> {
        match self.store.get_sync_state(&[CATCHUP_SYNC_STATE_PATH]) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(CatchupState::default()),
        }
    }

    pub fn add(&self, refs: &CatchupRefs) -> Result<(), SyncError> {
        self.store
            .transact("addCatchupSyncState", |tx| {
                add_in_tx(tx, refs).map_err(sync_to_graph)
            })
            .map_err(SyncError::from)
    }

    pub fn remove(&self, refs: &CatchupRefs) -> Result<(), SyncError> {
        self.store
            .transact("deleteCatchupSyncState", |tx| {
                remove_in_tx(tx, refs).map_err(sync_to_graph)
            })
            .map_err(SyncError::from)
    }

    pub fn set_last_update_count(
        &self,
        container_type: ContainerType,
        guids: &[String],
        count: i64,
    ) -> Result<(), SyncError> {
        self.store
            .transact("updateCatchupSyncLastUpdateCount", |tx| {
                set_last_update_count_in_tx(tx, container_type, guids, count).map_err(sync_to_graph)
            })
            .map_err(SyncError::from)
    }

    /// Minimum watermark across tracked ids of one kind; 0 when none are
    /// tracked. Remote cursors at or below this are safe to prune.
    pub fn min_last_update_count(&self, container_type: ContainerType) -> Result<i64, SyncError> {
        let state = self.state()?;
        let counts = match container_type {
            ContainerType::Notebook => &state.last_update_counts.notebooks,
            ContainerType::Workspace => &state.last_update_counts.workspaces,
        };
        Ok(counts.values().copied().min().unwrap_or(0))
    }
}

fn sync_to_graph(err: SyncError) -> carta_graph::GraphError {
    carta_graph::GraphError::Serialization(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use carta_graph::{GraphContext, SchemaRegistry};

    fn tracker() -> CatchupTracker {
        let schema = SchemaRegistry::new(vec![]).unwrap();
        let store = Arc::new(GraphStore::new(GraphContext::new(Arc::new(schema))));
        CatchupTracker::new(store)
    }

    fn refs(notebooks: &[&str], workspaces: &[&str]) -> CatchupRefs {
        CatchupRefs {
            notebooks: notebooks.iter().map(|s| s.to_string()).collect(),
            workspaces: workspaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_add_then_remove_round_trips_to_empty() {
        let tracker = tracker();
        tracker.add(&refs(&["x"], &[])).unwrap();
        assert!(!tracker.state().unwrap().is_empty());

        tracker.remove(&refs(&["x"], &[])).unwrap();
        assert_eq!(tracker.state().unwrap(), CatchupState::default());
    }

    #[test]
    fn test_add_is_idempotent_and_preserves_watermarks() {
        let tracker = tracker();
        tracker.add(&refs(&["a"], &["w"])).unwrap();
        tracker
            .set_last_update_count(ContainerType::Notebook, &["a".to_string()], 7)
            .unwrap();

        // Re-adding must not reset the existing watermark.
        tracker.add(&refs(&["a"], &[])).unwrap();
        let state = tracker.state().unwrap();
        assert_eq!(state.guids.notebooks, vec!["a".to_string()]);
        assert_eq!(state.last_update_counts.notebooks.get("a"), Some(&7));
        assert_eq!(state.last_update_counts.workspaces.get("w"), Some(&0));
    }

    #[test]
    fn test_remove_non_member_is_a_noop() {
        let tracker = tracker();
        tracker.add(&refs(&["a"], &[])).unwrap();
        tracker.remove(&refs(&["missing"], &["also-missing"])).unwrap();
        let state = tracker.state().unwrap();
        assert_eq!(state.guids.notebooks, vec!["a".to_string()]);
    }

    #[test]
    fn test_min_last_update_count() {
        let tracker = tracker();
        assert_eq!(
            tracker.min_last_update_count(ContainerType::Notebook).unwrap(),
            0
        );

        tracker.add(&refs(&["a", "b"], &[])).unwrap();
        tracker
            .set_last_update_count(ContainerType::Notebook, &["a".to_string()], 5)
            .unwrap();
        tracker
            .set_last_update_count(ContainerType::Notebook, &["b".to_string()], 3)
            .unwrap();
        assert_eq!(
            tracker.min_last_update_count(ContainerType::Notebook).unwrap(),
            3
        );

        // Workspaces are tracked independently.
        assert_eq!(
            tracker.min_last_update_count(ContainerType::Workspace).unwrap(),
            0
        );
    }

    #[test]
    fn test_every_tracked_id_has_a_watermark() {
        let tracker = tracker();
        tracker.add(&refs(&["a", "b"], &["w1"])).unwrap();
        let state = tracker.state().unwrap();
        for guid in &state.guids.notebooks {
            assert!(state.last_update_counts.notebooks.contains_key(guid));
        }
        for guid in &state.guids.workspaces {
            assert!(state.last_update_counts.workspaces.contains_key(guid));
        }
    }
}
