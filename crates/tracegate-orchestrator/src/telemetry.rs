use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct OrchestratorTelemetry {
    requests: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    late_failures_captured: AtomicU64,
    late_successes_discarded: AtomicU64,
    begin_failures: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    commit_failures: AtomicU64,
    rollback_failures: AtomicU64,
    warnings: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub late_failures_captured: u64,
    pub late_successes_discarded: u64,
    pub begin_failures: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub commit_failures: u64,
    pub rollback_failures: u64,
    pub warnings: u64,
}

impl OrchestratorTelemetry {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_late_failure_captured(&self) {
        self.late_failures_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_late_success_discarded(&self) {
        self.late_successes_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_begin_failure(&self) {
        self.begin_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback_failure(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_warnings(&self, count: usize) {
        self.warnings.fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            late_failures_captured: self.late_failures_captured.load(Ordering::Relaxed),
            late_successes_discarded: self.late_successes_discarded.load(Ordering::Relaxed),
            begin_failures: self.begin_failures.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
        }
    }
}
