//! Per-group activity counters.
//!
//! Plain atomics bumped on the hot paths and emitted as structured log
//! events from the spiller's idle loop. This is bookkeeping, not a metrics
//! pipeline; anything heavier belongs to the hosting worker.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GroupCounters {
    commits_accepted: AtomicU64,
    commits_duplicate: AtomicU64,
    queue_commits: AtomicU64,
    spill_cycles: AtomicU64,
    peeks_served: AtomicU64,
    peeks_from_store: AtomicU64,
    pops_applied: AtomicU64,
}

/// A point-in-time copy of [`GroupCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub commits_accepted: u64,
    pub commits_duplicate: u64,
    pub queue_commits: u64,
    pub spill_cycles: u64,
    pub peeks_served: u64,
    pub peeks_from_store: u64,
    pub pops_applied: u64,
}

impl GroupCounters {
    pub fn record_commit(&self, duplicate: bool) {
        if duplicate {
            self.commits_duplicate.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commits_accepted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_queue_commit(&self) {
        self.queue_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spill_cycle(&self) {
        self.spill_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peek(&self, touched_store: bool) {
        self.peeks_served.fetch_add(1, Ordering::Relaxed);
        if touched_store {
            self.peeks_from_store.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_pop(&self) {
        self.pops_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            commits_accepted: self.commits_accepted.load(Ordering::Relaxed),
            commits_duplicate: self.commits_duplicate.load(Ordering::Relaxed),
            queue_commits: self.queue_commits.load(Ordering::Relaxed),
            spill_cycles: self.spill_cycles.load(Ordering::Relaxed),
            peeks_served: self.peeks_served.load(Ordering::Relaxed),
            peeks_from_store: self.peeks_from_store.load(Ordering::Relaxed),
            pops_applied: self.pops_applied.load(Ordering::Relaxed),
        }
    }
}
