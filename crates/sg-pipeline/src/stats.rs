use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free pipeline counters, shared by workers, the router and
/// requesters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cache_hits: AtomicU64,
    evaluator_calls: AtomicU64,
    discarded: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    counter!(record_submitted, submitted);
    counter!(record_completed, completed);
    counter!(record_failed, failed);
    counter!(record_timed_out, timed_out);
    counter!(record_cache_hit, cache_hits);
    counter!(record_evaluator_call, evaluator_calls);
    counter!(record_discarded, discarded);

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            evaluator_calls: self.evaluator_calls.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Requests accepted onto the request queue.
    pub submitted: u64,
    /// Results produced by workers (success or failure).
    pub completed: u64,
    /// Worker-produced failure results.
    pub failed: u64,
    /// Slots handed back to a requester as timed out, counted once each.
    pub timed_out: u64,
    pub cache_hits: u64,
    pub evaluator_calls: u64,
    /// Results dropped because their requester or batch was gone.
    pub discarded: u64,
}
