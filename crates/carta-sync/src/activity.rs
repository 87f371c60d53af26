//! Sync activities and their queue.
//!
//! An activity is one schedulable unit of sync work (an incremental run, a
//! catch-up pass). The queue is priority-ordered and time-gated: an activity
//! becomes eligible once its `run_after` timestamp passes. A running
//! activity may enqueue follow-up work (catch-up after content sync) without
//! blocking its own run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use carta_graph::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL_MS: i64 = 30_000;
pub const MIN_POLL_INTERVAL_MS: i64 = 5_000;
pub const RETRY_TIMEOUT_MS: i64 = 10_000;
pub const POLL_JITTER: f64 = 0.25;
/// Background-priority activities defer their first run by this much.
pub const BACKGROUND_RUN_DELAY_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncActivityType {
    IncrementalSync,
    CatchupSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncActivityPriority {
    InitialDownsync,
    Immediate,
    Background,
}

impl SyncActivityPriority {
    /// Lower rank runs first.
    fn rank(self) -> u8 {
        match self {
            SyncActivityPriority::InitialDownsync => 0,
            SyncActivityPriority::Immediate => 1,
            SyncActivityPriority::Background => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    Queued,
    Running,
    Completed,
    Retryable,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncActivity {
    pub id: Uuid,
    pub activity_type: SyncActivityType,
    pub priority: SyncActivityPriority,
    pub subpriority: u32,
    /// Epoch millis before which the activity must not run.
    pub run_after: i64,
}

impl SyncActivity {
    pub fn new(
        activity_type: SyncActivityType,
        priority: SyncActivityPriority,
        subpriority: u32,
        now_ms: i64,
    ) -> Self {
        let delay = match priority {
            SyncActivityPriority::Background => BACKGROUND_RUN_DELAY_MS,
            _ => 0,
        };
        Self {
            id: Uuid::new_v4(),
            activity_type,
            priority,
            subpriority,
            run_after: now_ms + delay,
        }
    }

    pub fn run_after(mut self, at_ms: i64) -> Self {
        self.run_after = at_ms;
        self
    }

    /// Ephemeral progress bucket size for this activity's table entry.
    pub fn progress_bucket_size(&self) -> f64 {
        if self.subpriority > 0 {
            5000.0
        } else {
            1000.0
        }
    }
}

/// Poll interval with deterministic jitter. `unit` in `[0,1]` spreads
/// clients; the result never drops below [`MIN_POLL_INTERVAL_MS`].
pub fn jittered_poll_interval(base_ms: i64, unit: f64) -> i64 {
    let unit = unit.clamp(0.0, 1.0);
    let scaled = base_ms as f64 * (1.0 - POLL_JITTER * unit);
    (scaled as i64).max(MIN_POLL_INTERVAL_MS)
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    activity: SyncActivity,
    state: ActivityState,
}

/// Priority queue over activities. Single consumer per sync context; the
/// queue itself is thread-safe so producers (a running activity enqueueing
/// catch-up) do not contend with the scheduler loop.
pub struct ActivityQueue {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<Entry>>,
    disabled: AtomicBool,
}

impl ActivityQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(Vec::new()),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, activity: SyncActivity) {
        tracing::debug!(
            activity = ?activity.activity_type,
            run_after = activity.run_after,
            "enqueue"
        );
        self.entries.lock().push(Entry {
            activity,
            state: ActivityState::Queued,
        });
    }

    /// Pop the best eligible activity and mark it running. Eligibility:
    /// queued, `run_after` passed; best: priority rank, then subpriority,
    /// then earliest `run_after`.
    pub fn next_ready(&self) -> Option<SyncActivity> {
        let now = self.clock.now_ms();
        if self.disabled.load(Ordering::Relaxed) {
            return None;
        }
        let mut entries = self.entries.lock();
        let best = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == ActivityState::Queued && e.activity.run_after <= now)
            .min_by_key(|(_, e)| {
                (
                    e.activity.priority.rank(),
                    e.activity.subpriority,
                    e.activity.run_after,
                )
            })
            .map(|(i, _)| i)?;
        entries[best].state = ActivityState::Running;
        Some(entries[best].activity.clone())
    }

    /// Record an activity's terminal state. `Retryable` and `Failed` both
    /// schedule a fresh queued attempt after the retry timeout.
    pub fn finish(&self, id: Uuid, state: ActivityState) {
        let retry = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.iter_mut().find(|e| e.activity.id == id) else {
                return;
            };
            entry.state = state;
            matches!(state, ActivityState::Retryable | ActivityState::Failed)
                .then(|| entry.activity.clone())
        };
        if let Some(prev) = retry {
            let next = SyncActivity {
                id: Uuid::new_v4(),
                run_after: self.clock.now_ms() + RETRY_TIMEOUT_MS,
                ..prev
            };
            self.enqueue(next);
        }
    }

    pub fn state_of(&self, id: Uuid) -> Option<ActivityState> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.activity.id == id)
            .map(|e| e.state)
    }

    /// True when some activity of this type is still waiting to run.
    pub fn has_queued(&self, activity_type: SyncActivityType) -> bool {
        self.entries.lock().iter().any(|e| {
            e.state == ActivityState::Queued && e.activity.activity_type == activity_type
        })
    }

    pub fn queued_len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.state == ActivityState::Queued)
            .count()
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }
}
