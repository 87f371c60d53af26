//! Durable persistence for the carta graph.
//!
//! The storage manager owns one [`GraphStore`] per account and keeps two
//! files alongside it:
//!
//! - a binary snapshot of the graph (magic header + version, written on
//!   every flush),
//! - a JSON changelog of every change applied through the manager, with
//!   source attribution and status, supporting rollback by replay.
//!
//! Writers describe mutations as [`ChangeOp`] values; the manager applies
//! each change in a single graph transaction, so a change is either fully
//! visible or not at all. Changes that fail validation are recorded as
//! rejected in the changelog instead of aborting the flush.


use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use carta_graph::{FieldValue, GraphContext, GraphError, GraphStore, NodeRef};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a storage change.
pub type ChangeId = Uuid;

/// One graph mutation, serializable so the changelog can replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeOp {
    CreateNode {
        node_type: String,
        id: String,
        fields: BTreeMap<String, FieldValue>,
    },
    UpdateFields {
        node_type: String,
        id: String,
        fields: BTreeMap<String, FieldValue>,
    },
    DeleteNode {
        node_type: String,
        id: String,
    },
    AddEdge {
        edge: String,
        src_type: String,
        src_id: String,
        dst_type: String,
        dst_id: String,
    },
    RemoveEdge {
        edge: String,
        src_type: String,
        src_id: String,
        dst_type: String,
        dst_id: String,
    },
}

/// Source of a change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeSource {
    /// Applied by the sync orchestrator from remote deltas.
    RemoteSync {
        session_id: Uuid,
        sync_context: String,
    },
    /// Local optimistic write.
    UserEdit { user_id: Option<String> },
    /// System-generated (migration, repair).
    System { reason: String },
}

/// A change to the entity graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub timestamp: DateTime<Utc>,
    pub source: ChangeSource,
    pub ops: Vec<ChangeOp>,
    pub status: ChangeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeStatus {
    Pending,
    Applied,
    Rejected { reason: String },
    Rolled { reason: String },
}

// ============================================================================
// Storage Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the binary graph snapshot.
    pub graph_path: PathBuf,
    /// Path to the JSON changelog.
    pub changelog_path: PathBuf,
    /// Maximum pending changes before an automatic flush.
    pub max_pending: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            graph_path: PathBuf::from("./graph.crtg"),
            changelog_path: PathBuf::from("./changelog.json"),
            max_pending: 100,
        }
    }
}

// ============================================================================
// Storage Manager
// ============================================================================

pub struct GraphStorage {
    config: StorageConfig,
    ctx: GraphContext,
    /// Swapped wholesale on rollback; callers re-fetch via [`Self::store`].
    store: RwLock<Arc<GraphStore>>,
    pending: RwLock<Vec<Change>>,
    changelog: RwLock<Vec<Change>>,
}

impl GraphStorage {
    /// Open storage, loading the snapshot and changelog when they exist.
    pub fn new(ctx: GraphContext, config: StorageConfig) -> anyhow::Result<Self> {
        let store = if config.graph_path.exists() {
            let bytes = std::fs::read(&config.graph_path)?;
            GraphStore::from_bytes(ctx.clone(), &bytes)?
        } else {
            GraphStore::new(ctx.clone())
        };

        let changelog: Vec<Change> = if config.changelog_path.exists() {
            let contents = std::fs::read_to_string(&config.changelog_path)?;
            serde_json::from_str(&contents)?
        } else {
            Vec::new()
        };

        Ok(Self {
            config,
            ctx,
            store: RwLock::new(Arc::new(store)),
            pending: RwLock::new(Vec::new()),
            changelog: RwLock::new(changelog),
        })
    }

    /// The live graph store. Re-fetch after a rollback; handles held across
    /// one keep reading the pre-rollback graph.
    pub fn store(&self) -> Arc<GraphStore> {
        self.store.read().clone()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // ========================================================================
    // Write Operations
    // ========================================================================

    /// Queue a change. Flushes automatically once `max_pending` is reached.
    pub fn record(&self, ops: Vec<ChangeOp>, source: ChangeSource) -> anyhow::Result<ChangeId> {
        let change = Change {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            ops,
            status: ChangeStatus::Pending,
        };
        let change_id = change.id;
        self.pending.write().push(change);

        if self.pending.read().len() >= self.config.max_pending {
            self.flush()?;
        }
        Ok(change_id)
    }

    /// Apply all pending changes and persist snapshot + changelog.
    pub fn flush(&self) -> anyhow::Result<Vec<ChangeId>> {
        let pending: Vec<Change> = self.pending.write().drain(..).collect();
        let mut applied = Vec::new();
        let store = self.store();

        for mut change in pending {
            match apply_change(&store, &change) {
                Ok(()) => {
                    change.status = ChangeStatus::Applied;
                    applied.push(change.id);
                }
                Err(err) => {
                    tracing::warn!(change = %change.id, error = %err, "change rejected");
                    change.status = ChangeStatus::Rejected {
                        reason: err.to_string(),
                    };
                }
            }
            self.changelog.write().push(change);
        }

        self.save_changelog()?;
        self.save_snapshot()?;
        Ok(applied)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn save_changelog(&self) -> anyhow::Result<()> {
        let changelog = self.changelog.read();
        let json = serde_json::to_string_pretty(&*changelog)?;
        std::fs::write(&self.config.changelog_path, json)?;
        Ok(())
    }

    fn save_snapshot(&self) -> anyhow::Result<()> {
        let bytes = self.store().to_bytes()?;
        std::fs::write(&self.config.graph_path, bytes)?;
        Ok(())
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    pub fn changelog(&self) -> Vec<Change> {
        self.changelog.read().clone()
    }

    pub fn pending(&self) -> Vec<Change> {
        self.pending.read().clone()
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Roll back every change after `change_id` and rebuild the graph from
    /// the remaining applied history.
    pub fn rollback_to(&self, change_id: ChangeId) -> anyhow::Result<()> {
        let idx = {
            let changelog = self.changelog.read();
            changelog
                .iter()
                .position(|c| c.id == change_id)
                .ok_or_else(|| anyhow::anyhow!("change not found: {change_id}"))?
        };

        {
            let mut changelog = self.changelog.write();
            for change in changelog.iter_mut().skip(idx + 1) {
                if matches!(change.status, ChangeStatus::Applied) {
                    change.status = ChangeStatus::Rolled {
                        reason: format!("rolled back to {change_id}"),
                    };
                }
            }
        }

        self.rebuild_from_changelog()?;
        self.save_changelog()?;
        self.save_snapshot()?;
        Ok(())
    }

    /// Replay the applied history into a fresh store and swap it in.
    fn rebuild_from_changelog(&self) -> anyhow::Result<()> {
        let fresh = GraphStore::new(self.ctx.clone());
        {
            let changelog = self.changelog.read();
            for change in changelog.iter() {
                if matches!(change.status, ChangeStatus::Applied) {
                    if let Err(err) = apply_change(&fresh, change) {
                        tracing::warn!(change = %change.id, error = %err, "skipped during rebuild");
                    }
                }
            }
        }
        *self.store.write() = Arc::new(fresh);
        Ok(())
    }
}

/// Apply one change inside a single graph transaction.
fn apply_change(store: &GraphStore, change: &Change) -> Result<(), GraphError> {
    store.transact("applyChange", |tx| {
        for op in &change.ops {
            match op {
                ChangeOp::CreateNode {
                    node_type,
                    id,
                    fields,
                } => {
                    tx.create_node(node_type, id, fields.clone())?;
                }
                ChangeOp::UpdateFields {
                    node_type,
                    id,
                    fields,
                } => {
                    tx.update_fields(&NodeRef::new(node_type, id), fields.clone())?;
                }
                ChangeOp::DeleteNode { node_type, id } => {
                    tx.delete_node(&NodeRef::new(node_type, id))?;
                }
                ChangeOp::AddEdge {
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
                ChangeOp::RemoveEdge {
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
        }
        Ok(())
    })
}

// ============================================================================
// Convenience Functions
// ============================================================================

/// Open storage rooted in one directory, with default file names.
pub fn open_storage(ctx: GraphContext, data_dir: &std::path::Path) -> anyhow::Result<GraphStorage> {
    let config = StorageConfig {
        graph_path: data_dir.join("graph.crtg"),
        changelog_path: data_dir.join("changelog.json"),
        ..Default::default()
    };
    GraphStorage::new(ctx, config)
}
