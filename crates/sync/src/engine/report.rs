#![forbid(unsafe_code)]

use crate::clock::ts_ms_to_rfc3339;
use crate::error::FailureKind;
use tk_core::EntityKind;
use tk_core::ids::ClientId;
use tk_storage::{OutboxStats, PullApplied};

/// A mutation that stopped being sent automatically during a cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationFailure {
    pub seq: i64,
    pub client_id: ClientId,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullFailure {
    pub kind: EntityKind,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub pushed: usize,
    pub requeued: usize,
    pub failures: Vec<MutationFailure>,
    pub conflicts_merged: usize,
    pub conflicts_accepted: usize,
    pub conflicts_manual: usize,
    pub pulled: usize,
    pub removed: usize,
    pub deferred: usize,
    pub deferred_applied: usize,
    pub unchanged: usize,
    pub pull_errors: Vec<PullFailure>,
    pub auth_refreshes: usize,
    pub cancelled: bool,
    /// Another cycle was running; this request became its follow-up.
    pub coalesced: bool,
}

impl CycleReport {
    pub(crate) fn started(now_ms: i64) -> Self {
        Self {
            started_at_ms: now_ms,
            finished_at_ms: now_ms,
            ..Self::default()
        }
    }

    pub(crate) fn coalesced(now_ms: i64) -> Self {
        Self {
            coalesced: true,
            ..Self::started(now_ms)
        }
    }

    pub(crate) fn record_pull(&mut self, applied: PullApplied) {
        self.pulled += applied.applied;
        self.removed += applied.removed;
        self.deferred += applied.deferred;
        self.unchanged += applied.unchanged;
    }

    /// Nothing failed, nothing waits for the user.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.pull_errors.is_empty() && self.conflicts_manual == 0
    }

    pub fn started_at(&self) -> String {
        ts_ms_to_rfc3339(self.started_at_ms)
    }

    pub fn finished_at(&self) -> String {
        ts_ms_to_rfc3339(self.finished_at_ms)
    }
}

/// Snapshot for status displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncState {
    pub cycle_running: bool,
    pub outbox: OutboxStats,
    pub open_conflicts: usize,
    pub last_cycle: Option<CycleReport>,
}

impl SyncState {
    pub fn is_idle(&self) -> bool {
        !self.cycle_running && self.outbox.total() == 0
    }
}
