//! Error taxonomy for sync.
//!
//! The classification drives orchestrator behavior directly: transient
//! failures are swallowed per sub-task and retried on the next scheduled run,
//! auth failures route through token refresh before becoming fatal, and
//! everything else aborts the remainder of the run.

use carta_graph::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Caller/schema misuse. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// "Retry later" class; swallowed at the sub-task level.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Authentication failure; routed through token refresh first.
    #[error("auth failure: {0}")]
    Auth(String),

    /// The run was interrupted at a suspension point.
    #[error("sync interrupted")]
    Interrupted,

    /// Anything else. Aborts the run.
    #[error("sync failure: {0}")]
    Hard(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<GraphError> for SyncError {
    fn from(err: GraphError) -> Self {
        if err.is_configuration() {
            SyncError::Configuration(err.to_string())
        } else {
            SyncError::Hard(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Hard(format!("sync state serialization: {err}"))
    }
}
