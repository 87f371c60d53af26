//! Sync progress reporting.
//!
//! Progress is derived from ephemeral per-bucket tables owned by the graph
//! store: each sync flow writes `{total_size, percent_complete, start_time,
//! end_time}` under its bucket key, and the snapshot folds a whole table into
//! one fraction. Two rules shape the aggregate:
//!
//! - a bucket that started and finished within 500ms is scaled by
//!   `elapsed / 500` (clamped to `[0,1]`) so trivially-fast buckets do not
//!   dominate the weighting;
//! - a bucket that cannot report `total_size` is excluded from the aggregate
//!   instead of failing the read.
//!
//! Percentages floor (`floor(precision*100 * current/total) / precision`) so
//! displayed progress never overstates completion.

use std::sync::Arc;

use carta_graph::{GraphStore, GraphTransaction};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::SyncError;

pub const INITIAL_SYNC_PROGRESS_TABLE: &str = "initialSync";
pub const BACKGROUND_SYNC_PROGRESS_TABLE: &str = "backgroundSync";
pub const CONTENT_FETCH_PROGRESS_TABLE: &str = "contentFetch";

pub const SYNC_TYPE_SYNC_STATE_PATH: &str = "SyncType";
pub const LAST_SYNC_TIME_PATH: &str = "lastSyncTime";
pub const LAST_SYNC_START_TIME_PATH: &str = "lastSyncStartTime";

/// Buckets faster than this window are down-weighted proportionally.
const DOWNWEIGHT_WINDOW_MS: f64 = 500.0;

const DEFAULT_PRECISION: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncProgressType {
    None,
    InitialSync,
    IncrementalSync,
    CatchupSync,
}

/// Observable sync state, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress_percent: f64,
    pub background_progress_percent: f64,
    pub content_fetch_sync_progress_percent: f64,
    pub paused: bool,
    pub last_sync_time: i64,
    pub sync_progress_type: SyncProgressType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DownsyncCount {
    pub current: f64,
    pub total: f64,
    pub syncer_count: usize,
}

/// Fold one progress table into weighted totals.
pub fn downsync_count(store: &GraphStore, table: &str) -> DownsyncCount {
    let mut out = DownsyncCount::default();
    for key in store.progress_keys(table) {
        let Some(bucket) = store.get_progress(table, &key) else {
            continue;
        };
        let Some(total_size) = bucket.total_size else {
            // No reported size; exclude rather than fail the aggregate.
            continue;
        };
        out.syncer_count += 1;
        let mut size_scale = 1.0;
        if let (Some(start), Some(end)) = (bucket.start_time, bucket.end_time) {
            let elapsed = (end - start) as f64;
            size_scale = (elapsed / DOWNWEIGHT_WINDOW_MS).clamp(0.0, 1.0);
        }
        let weighted = total_size * size_scale;
        out.total += weighted;
        out.current += bucket.percent_complete * weighted;
    }
    out
}

/// `floor(precision*100 * current/total) / precision`. Floor, not round:
/// displayed progress must never run ahead of actual progress.
fn floor_percent(precision: u32, current: f64, total: f64) -> f64 {
    let prec_up = (precision * 100) as f64;
    let prec_down = 1.0 / precision as f64;
    prec_down * (prec_up * current / total).floor()
}

fn table_percent(count: &DownsyncCount, precision: u32) -> f64 {
    if count.syncer_count == 0 || count.total == 0.0 {
        return 100.0;
    }
    floor_percent(precision, count.current, count.total)
}

/// Compute the observable progress snapshot. `paused` comes from the
/// activity queue; everything else from store state.
pub fn progress_snapshot(
    store: &GraphStore,
    paused: bool,
    precision: Option<u32>,
) -> ProgressSnapshot {
    let precision = precision.unwrap_or(DEFAULT_PRECISION).max(1);

    let last_sync_time = store
        .get_sync_state(&[LAST_SYNC_TIME_PATH])
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let sync_progress_type = store
        .get_sync_state(&[SYNC_TYPE_SYNC_STATE_PATH])
        .and_then(|v| {
            v.get("syncProgressType")
                .cloned()
                .and_then(|t| serde_json::from_value(t).ok())
        })
        .unwrap_or(SyncProgressType::None);

    let background = downsync_count(store, BACKGROUND_SYNC_PROGRESS_TABLE);
    let content = downsync_count(store, CONTENT_FETCH_PROGRESS_TABLE);
    let initial = downsync_count(store, INITIAL_SYNC_PROGRESS_TABLE);

    let progress_percent = if initial.syncer_count == 0
        || initial.total == 0.0
        || initial.current == initial.total
    {
        100.0
    } else {
        floor_percent(precision, initial.current, initial.total)
    };

    ProgressSnapshot {
        progress_percent,
        background_progress_percent: table_percent(&background, precision),
        content_fetch_sync_progress_percent: table_percent(&content, precision),
        paused,
        last_sync_time,
        sync_progress_type,
    }
}

// ============================================================================
// Progress-type bookkeeping
// ============================================================================

pub fn update_sync_progress_type_in_tx(
    tx: &mut GraphTransaction,
    progress_type: SyncProgressType,
) -> Result<(), SyncError> {
    tx.update_sync_state(
        &[SYNC_TYPE_SYNC_STATE_PATH],
        json!({ "syncProgressType": serde_json::to_value(progress_type)? }),
    );
    Ok(())
}

pub fn update_sync_progress_type(
    store: &Arc<GraphStore>,
    progress_type: SyncProgressType,
) -> Result<(), SyncError> {
    store
        .transact("updateSyncType", |tx| {
            update_sync_progress_type_in_tx(tx, progress_type)
                .map_err(|e| carta_graph::GraphError::Serialization(e.to_string()))
        })
        .map_err(SyncError::from)
}

/// Clear the initial-sync table and reset the progress type; called when a
/// progress-reporting run finishes so later reads report 100%.
pub fn clear_sync_progress(store: &Arc<GraphStore>) -> Result<(), SyncError> {
    store
        .transact("clearInitialSyncProgressTable", |tx| {
            tx.clear_progress_table(INITIAL_SYNC_PROGRESS_TABLE);
            update_sync_progress_type_in_tx(tx, SyncProgressType::None)
                .map_err(|e| carta_graph::GraphError::Serialization(e.to_string()))
        })
        .map_err(SyncError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carta_graph::{GraphContext, ProgressBucket, SchemaRegistry};

    fn store() -> Arc<GraphStore> {
        let schema = SchemaRegistry::new(vec![]).unwrap();
        Arc::new(GraphStore::new(GraphContext::new(Arc::new(schema))))
    }

    fn put(store: &GraphStore, table: &str, key: &str, bucket: ProgressBucket) {
        store
            .transact("putProgress", |tx| {
                tx.put_progress(table, key, bucket);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_empty_tables_report_complete() {
        let store = store();
        let snapshot = progress_snapshot(&store, false, None);
        assert_eq!(snapshot.progress_percent, 100.0);
        assert_eq!(snapshot.background_progress_percent, 100.0);
        assert_eq!(snapshot.content_fetch_sync_progress_percent, 100.0);
        assert_eq!(snapshot.sync_progress_type, SyncProgressType::None);
    }

    #[test]
    fn test_percent_floors_rather_than_rounds() {
        let store = store();
        put(
            &store,
            INITIAL_SYNC_PROGRESS_TABLE,
            "a",
            ProgressBucket {
                total_size: Some(1000.0),
                percent_complete: 1.0 / 3.0,
                start_time: None,
                end_time: None,
            },
        );
        let snapshot = progress_snapshot(&store, false, None);
        // 33.333…% floors to 33.3 at the default precision of 10.
        assert!((snapshot.progress_percent - 33.3).abs() < 1e-9);
    }

    #[test]
    fn test_fast_buckets_are_downweighted() {
        let store = store();
        // Finished in 100ms of a 500ms window: weight scaled by 0.2.
        put(
            &store,
            INITIAL_SYNC_PROGRESS_TABLE,
            "fast",
            ProgressBucket {
                total_size: Some(1000.0),
                percent_complete: 1.0,
                start_time: Some(0),
                end_time: Some(100),
            },
        );
        put(
            &store,
            INITIAL_SYNC_PROGRESS_TABLE,
            "slow",
            ProgressBucket {
                total_size: Some(1000.0),
                percent_complete: 0.0,
                start_time: Some(0),
                end_time: Some(2000),
            },
        );
        let count = downsync_count(&store, INITIAL_SYNC_PROGRESS_TABLE);
        assert_eq!(count.syncer_count, 2);
        assert_eq!(count.total, 200.0 + 1000.0);
        assert_eq!(count.current, 200.0);
    }

    #[test]
    fn test_sizeless_buckets_are_excluded() {
        let store = store();
        put(
            &store,
            BACKGROUND_SYNC_PROGRESS_TABLE,
            "unsized",
            ProgressBucket {
                total_size: None,
                percent_complete: 0.5,
                start_time: None,
                end_time: None,
            },
        );
        put(
            &store,
            BACKGROUND_SYNC_PROGRESS_TABLE,
            "sized",
            ProgressBucket {
                total_size: Some(100.0),
                percent_complete: 0.5,
                start_time: None,
                end_time: None,
            },
        );
        let count = downsync_count(&store, BACKGROUND_SYNC_PROGRESS_TABLE);
        assert_eq!(count.syncer_count, 1);
        assert_eq!(count.total, 100.0);

        let snapshot = progress_snapshot(&store, false, None);
        assert_eq!(snapshot.background_progress_percent, 50.0);
    }

    #[test]
    fn test_clear_sync_progress_resets_type_and_table() {
        let store = store();
        put(
            &store,
            INITIAL_SYNC_PROGRESS_TABLE,
            "a",
            ProgressBucket {
                total_size: Some(100.0),
                percent_complete: 0.2,
                start_time: None,
                end_time: None,
            },
        );
        update_sync_progress_type(&store, SyncProgressType::IncrementalSync).unwrap();
        assert_eq!(
            progress_snapshot(&store, false, None).sync_progress_type,
            SyncProgressType::IncrementalSync
        );

        clear_sync_progress(&store).unwrap();
        let snapshot = progress_snapshot(&store, false, None);
        assert_eq!(snapshot.progress_percent, 100.0);
        assert_eq!(snapshot.sync_progress_type, SyncProgressType::None);
    }
}
