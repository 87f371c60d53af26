//! carta-sync: incremental sync orchestration for the carta graph.
//!
//! The orchestrator keeps a local entity graph consistent with a remote
//! service:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      SYNC ORCHESTRATOR                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ActivityQueue ──► IncrementalSync run                           │
//! │                      │ event-log (0.05)                          │
//! │                      │ messages  (0.20)                          │
//! │                      │ content   (0.35, split across accounts)   │
//! │                      │ shared notebooks / notes (0.20 + 0.20)    │
//! │                      ▼                                           │
//! │                    GraphStorage transactions                     │
//! │                      │                                           │
//! │                      ├──► progress tables (observable)           │
//! │                      └──► CatchupTracker ──► CatchupSync run     │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each sync context (personal account, vault account, shared resource) is a
//! single logical writer; independent contexts run as independent tasks.
//! Cancellation is cooperative: a token checked at suspension points between
//! sub-tasks, raced against in-flight remote awaits.

pub mod activity;
pub mod catchup;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod token;

pub use activity::{
    ActivityQueue, ActivityState, SyncActivity, SyncActivityPriority, SyncActivityType,
    jittered_poll_interval, DEFAULT_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS, POLL_JITTER,
    RETRY_TIMEOUT_MS,
};
pub use catchup::{CatchupRefs, CatchupState, CatchupTracker, ContainerType};
pub use error::SyncError;
pub use orchestrator::{interruptible, ExceptionSink, SyncConfig, SyncOrchestrator};
pub use progress::{
    clear_sync_progress, progress_snapshot, update_sync_progress_type, DownsyncCount,
    ProgressSnapshot, SyncProgressType, BACKGROUND_SYNC_PROGRESS_TABLE,
    CONTENT_FETCH_PROGRESS_TABLE, INITIAL_SYNC_PROGRESS_TABLE,
};
pub use protocol::{AccountKind, ContentUnit, NodeDelta, RemoteProtocol, SyncUnit};
pub use token::{TokenRefreshCache, TokenRefresher};
