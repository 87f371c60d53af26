//! Remote protocol collaborator.
//!
//! The orchestrator consumes the remote service through one opaque "sync a
//! unit of work" operation per sub-task kind. Each call returns the deltas to
//! persist plus the remote cursor it advanced to; wire encoding and
//! retry/backoff of individual calls live behind this trait, not in the
//! orchestrator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use carta_graph::FieldValue;
use serde::{Deserialize, Serialize};

use crate::catchup::CatchupRefs;
use crate::error::SyncError;

/// Which account a content sub-task targets within one sync context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    Personal,
    Vault,
}

impl AccountKind {
    pub fn sync_context(self) -> &'static str {
        match self {
            AccountKind::Personal => "personal",
            AccountKind::Vault => "vault",
        }
    }
}

/// One graph mutation pulled from the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeDelta {
    Upsert {
        node_type: String,
        id: String,
        fields: BTreeMap<String, FieldValue>,
    },
    Delete {
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

/// Result of one successful unit of sync work.
#[derive(Debug, Clone, Default)]
pub struct SyncUnit {
    pub deltas: Vec<NodeDelta>,
    /// Remote cursor after this unit; persisted as `lastUpdateCount`.
    pub last_update_count: i64,
}

/// Content sync additionally reports entities the incremental cursor could
/// not confirm (moved/merged containers), destined for catch-up.
#[derive(Debug, Clone, Default)]
pub struct ContentUnit {
    pub unit: SyncUnit,
    pub catchup_refs: CatchupRefs,
}

/// The remote service, one operation per sub-task kind. Implementations
/// classify their failures via [`SyncError`]; the orchestrator acts on the
/// classification alone.
#[async_trait]
pub trait RemoteProtocol: Send + Sync {
    /// Current remote cursor for an account's content, used to decide whether
    /// a content pass has anything to do.
    async fn content_update_count(&self, account: AccountKind) -> Result<i64, SyncError>;

    async fn sync_event_log(&self) -> Result<SyncUnit, SyncError>;

    async fn sync_messages(&self) -> Result<SyncUnit, SyncError>;

    async fn sync_content(&self, account: AccountKind) -> Result<ContentUnit, SyncError>;

    async fn sync_shared_notebook(&self, guid: &str) -> Result<SyncUnit, SyncError>;

    async fn sync_shared_note(&self, guid: &str) -> Result<SyncUnit, SyncError>;

    /// Re-verify one container out of band. Returns the container's deltas
    /// and its current remote update count (the new catch-up watermark).
    async fn catchup_container(
        &self,
        container_type: &str,
        guid: &str,
    ) -> Result<SyncUnit, SyncError>;
}
