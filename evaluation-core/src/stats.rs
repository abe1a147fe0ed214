//! Per-worker integer counters, published on `Stop` and available via
//! `Stats()` at any time via atomic loads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter block. Each worker owns one; `snapshot()` is cheap and
/// safe to call concurrently with increments.
#[derive(Default)]
pub struct Stats {
    pub spans_processed: AtomicU64,
    pub evaluators_matched: AtomicU64,
    pub jobs_emitted: AtomicU64,
    pub jobs_processed: AtomicU64,
    pub scores_created: AtomicU64,
    pub llm_calls: AtomicU64,
    pub builtin_calls: AtomicU64,
    pub regex_calls: AtomicU64,
    pub triggers_processed: AtomicU64,
    pub errors_count: AtomicU64,
    pub active_streams: AtomicU64,
}

/// An immutable point-in-time copy of `Stats`, suitable for logging or
/// returning from `Stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub spans_processed: u64,
    pub evaluators_matched: u64,
    pub jobs_emitted: u64,
    pub jobs_processed: u64,
    pub scores_created: u64,
    pub llm_calls: u64,
    pub builtin_calls: u64,
    pub regex_calls: u64,
    pub triggers_processed: u64,
    pub errors_count: u64,
    pub active_streams: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            spans_processed: self.spans_processed.load(Ordering::Relaxed),
            evaluators_matched: self.evaluators_matched.load(Ordering::Relaxed),
            jobs_emitted: self.jobs_emitted.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            scores_created: self.scores_created.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            builtin_calls: self.builtin_calls.load(Ordering::Relaxed),
            regex_calls: self.regex_calls.load(Ordering::Relaxed),
            triggers_processed: self.triggers_processed.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
        }
    }

    pub fn add_errors(&self, count: u64) {
        if count > 0 {
            self.errors_count.fetch_add(count, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = Stats::default();
        stats.spans_processed.fetch_add(3, Ordering::Relaxed);
        stats.errors_count.fetch_add(1, Ordering::Relaxed);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.spans_processed, 3);
        assert_eq!(snapshot.errors_count, 1);
    }
}
