//! Per-invocation execution statistics
//!
//! Workers count on plain integers in their own state and merge into the
//! shared atomics once, when they exit; the hot path never touches shared
//! counters. The merged totals are write-only telemetry: they are logged
//! under the invocation's name and handed back to the caller, and the engine
//! never reads them back to make decisions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counts for one loop invocation
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LoopStats {
    /// Iterations started, committed or not
    pub iterations: u64,

    /// Iterations that committed (= iterations − conflicts)
    pub commits: u64,

    /// Iterations rolled back due to a conflict
    pub conflicts: u64,

    /// Items discovered and published by committed iterations
    pub pushes: u64,
}

/// One worker's private tally
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Tally {
    pub iterations: u64,
    pub conflicts: u64,
    pub pushes: u64,
}

/// Shared accumulator the tallies merge into
#[derive(Debug, Default)]
pub(crate) struct Totals {
    iterations: AtomicU64,
    conflicts: AtomicU64,
    pushes: AtomicU64,
}
//
impl Totals {
    /// Fold one worker's tally in
    ///
    /// Relaxed suffices: the executor only snapshots after joining all
    /// workers, which synchronizes with their exits.
    pub fn merge(&self, tally: &Tally) {
        self.iterations.fetch_add(tally.iterations, Ordering::Relaxed);
        self.conflicts.fetch_add(tally.conflicts, Ordering::Relaxed);
        self.pushes.fetch_add(tally.pushes, Ordering::Relaxed);
    }

    /// Snapshot the merged counts
    pub fn snapshot(&self) -> LoopStats {
        let iterations = self.iterations.load(Ordering::Relaxed);
        let conflicts = self.conflicts.load(Ordering::Relaxed);
        LoopStats {
            iterations,
            commits: iterations - conflicts,
            conflicts,
            pushes: self.pushes.load(Ordering::Relaxed),
        }
    }

    /// Log the merged counts under the invocation's name
    pub fn report(&self, name: &str) {
        let stats = self.snapshot();
        log::debug!(
            "loop {name:?}: {} iterations, {} commits, {} conflicts, {} pushes",
            stats.iterations,
            stats.commits,
            stats.conflicts,
            stats.pushes,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_snapshot() {
        let totals = Totals::default();
        totals.merge(&Tally {
            iterations: 5,
            conflicts: 2,
            pushes: 1,
        });
        totals.merge(&Tally {
            iterations: 3,
            conflicts: 0,
            pushes: 4,
        });
        assert_eq!(
            totals.snapshot(),
            LoopStats {
                iterations: 8,
                commits: 6,
                conflicts: 2,
                pushes: 5,
            }
        );
    }
}
