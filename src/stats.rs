//! Round counters and the end-of-loop report
//!
//! Workers keep plain local counters inside their round loop and publish
//! cumulative values into a padded per-worker slot once per phase, so the
//! hot paths never touch shared memory; the driver reduces the slots at
//! round boundaries.

use std::fmt;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

use crate::loom_testing::*;

pub(crate) struct PerThreadCounter {
    slots: Box<[CachePadded<AtomicUsize>]>,
}

impl PerThreadCounter {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            slots: (0..threads)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        }
    }

    /// Publish worker `tid`'s cumulative count (once per phase).
    pub(crate) fn publish(&self, tid: usize, cumulative: usize) {
        self.slots[tid].store(cumulative, Ordering::Relaxed);
    }

    pub(crate) fn reduce(&self) -> usize {
        self.slots.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }
}

/// What the loop did, reported when it finishes
#[derive(Debug, Clone, Default)]
pub struct ExecStats {
    /// Loop name from the configuration
    pub name: &'static str,
    /// Number of rounds executed (including the final empty one)
    pub rounds: usize,
    /// Iterations that committed
    pub committed: usize,
    /// Iterations attempted, retries included
    pub total: usize,
    /// Times the round buffer was spilled back into the window
    pub spills: usize,
    /// Initial size of the window worklist
    pub init_size: usize,
    /// Target window size chosen by each round's refill
    pub window_sizes: Vec<usize>,
}

impl ExecStats {
    /// Committed over attempted; 1.0 means no wasted speculation.
    pub fn efficiency(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.committed as f64 / self.total as f64
        }
    }

    /// Commits per round; a rough measure of exploited parallelism.
    pub fn avg_parallelism(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.committed as f64 / self.rounds as f64
        }
    }

    pub(crate) fn report(&self) {
        tracing::event!(
            name: "executor::stats",
            tracing::Level::INFO,
            loop_name = self.name,
            rounds = self.rounds,
            commits = self.committed,
            total = self.total,
            spills = self.spills,
            efficiency = self.efficiency(),
            avg_parallelism = self.avg_parallelism(),
        );
    }
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: rounds: {}", self.name, self.rounds)?;
        writeln!(f, "{}: commits: {}", self.name, self.committed)?;
        writeln!(f, "{}: total: {}", self.name, self.total)?;
        writeln!(f, "{}: efficiency: {:.3}", self.name, self.efficiency())?;
        write!(
            f,
            "{}: avg. parallelism: {:.3}",
            self.name,
            self.avg_parallelism()
        )
    }
}
