//! Per-reactor counters.
//!
//! Best-effort and node-local: relaxed atomics bumped from region tasks,
//! read through [`ReactorStats::snapshot`] for reports and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub transitions: u64,
    pub backfills_started: u64,
    pub backfills_completed: u64,
    pub backfill_failures: u64,
    pub chunks_applied: u64,
    pub branches_created: u64,
    pub erasures: u64,
    pub writes_committed: u64,
    pub echo_timeouts: u64,
    pub demotions_in_place: u64,
}

impl StatsSnapshot {
    /// Field-wise sum, for cluster-wide totals.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.transitions += other.transitions;
        self.backfills_started += other.backfills_started;
        self.backfills_completed += other.backfills_completed;
        self.backfill_failures += other.backfill_failures;
        self.chunks_applied += other.chunks_applied;
        self.branches_created += other.branches_created;
        self.erasures += other.erasures;
        self.writes_committed += other.writes_committed;
        self.echo_timeouts += other.echo_timeouts;
        self.demotions_in_place += other.demotions_in_place;
    }
}

#[derive(Debug, Default)]
pub struct ReactorStats {
    transitions: AtomicU64,
    backfills_started: AtomicU64,
    backfills_completed: AtomicU64,
    backfill_failures: AtomicU64,
    chunks_applied: AtomicU64,
    branches_created: AtomicU64,
    erasures: AtomicU64,
    writes_committed: AtomicU64,
    echo_timeouts: AtomicU64,
    demotions_in_place: AtomicU64,
}

impl ReactorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill_started(&self) {
        self.backfills_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill_completed(&self) {
        self.backfills_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill_failure(&self) {
        self.backfill_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunks_applied(&self, chunks: u64) {
        if chunks == 0 {
            return;
        }
        self.chunks_applied.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn record_branch_created(&self) {
        self.branches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_erasure(&self) {
        self.erasures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_committed(&self) {
        self.writes_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_echo_timeout(&self) {
        self.echo_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A demoted primary followed the new primary without a backfill.
    pub fn record_demotion_in_place(&self) {
        self.demotions_in_place.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transitions: self.transitions.load(Ordering::Relaxed),
            backfills_started: self.backfills_started.load(Ordering::Relaxed),
            backfills_completed: self.backfills_completed.load(Ordering::Relaxed),
            backfill_failures: self.backfill_failures.load(Ordering::Relaxed),
            chunks_applied: self.chunks_applied.load(Ordering::Relaxed),
            branches_created: self.branches_created.load(Ordering::Relaxed),
            erasures: self.erasures.load(Ordering::Relaxed),
            writes_committed: self.writes_committed.load(Ordering::Relaxed),
            echo_timeouts: self.echo_timeouts.load(Ordering::Relaxed),
            demotions_in_place: self.demotions_in_place.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_merge_sum_counters() {
        let stats = ReactorStats::new();
        stats.record_transition();
        stats.record_transition();
        stats.record_chunks_applied(0);
        stats.record_chunks_applied(3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transitions, 2);
        assert_eq!(snapshot.chunks_applied, 3);

        let mut total = StatsSnapshot::default();
        total.merge(&snapshot);
        total.merge(&snapshot);
        assert_eq!(total.transitions, 4);
        assert_eq!(total.writes_committed, 0);
    }
}
