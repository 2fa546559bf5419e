//! Task accounting for stages and pipelines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters of a single stage.
///
/// `failed` only counts failures originating at this stage. Failures forwarded from upstream are
/// counted where they happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStats {
    pub index: usize,
    pub name: String,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub duration: Duration,
}

/// Aggregate counters of a finished pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Tasks that completed every stage successfully.
    pub succeeded: u64,
    /// Tasks that failed at some stage.
    pub failed: u64,
    /// Tasks abandoned because of cancellation, in flight or still buffered.
    pub cancelled: u64,
    pub duration: Duration,
    pub stages: Vec<StageStats>,
}

impl PipelineStats {
    /// Total number of tasks accounted for.
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Lock-free counters shared by the workers of a pool.
#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl StageCounters {
    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self, count: u64) {
        self.cancelled.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, index: usize, name: &str, duration: Duration) -> StageStats {
        StageStats {
            index,
            name: name.to_string(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            duration,
        }
    }
}
