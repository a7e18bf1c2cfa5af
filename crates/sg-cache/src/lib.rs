//! # sg-cache
//!
//! Memoization of evaluator output keyed by input coordinates.
//!
//! Every backend implements [`ResultCache`] and is shared by all pipeline
//! workers, so implementations synchronize internally:
//! - [`LruCache`]: bounded in-memory least-recently-used cache
//! - [`NoopCache`]: memoization disabled
//! - [`StoreBackedCache`]: adapter over a fallible external [`CacheStore`]
//!   that degrades store errors to cache misses

mod lru;
mod noop;
mod store;

pub use lru::LruCache;
pub use noop::NoopCache;
pub use store::{CacheStore, StoreBackedCache};

use serde::Serialize;
use sg_types::{CacheBackend, InputRow, Row};
use std::fmt;
use std::sync::Arc;

/// Result cache backend contract.
pub trait ResultCache: Send + Sync + fmt::Debug {
    /// Look up a previously stored row. A hit counts as a use for recency.
    fn get(&self, input: &InputRow) -> Option<Row>;

    /// Store a row, keyed by its input. Eviction, if any, is silent.
    fn put(&self, row: Row);

    /// Number of entries currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> CacheStats;

    /// Short backend label used in logs and reports.
    fn backend_name(&self) -> &'static str;
}

/// Build the configured in-process backend.
pub fn build_cache(backend: CacheBackend, capacity: usize) -> Arc<dyn ResultCache> {
    match backend {
        CacheBackend::Lru => Arc::new(LruCache::new(capacity)),
        CacheBackend::Noop => Arc::new(NoopCache::new()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    /// Backend failures absorbed as misses or dropped writes.
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_rows::row;

    #[test]
    fn test_build_cache_selects_backend() {
        let lru = build_cache(CacheBackend::Lru, 4);
        assert_eq!(lru.backend_name(), "lru");
        lru.put(row(1.0, 1.0));
        assert!(lru.get(row(1.0, 0.0).input()).is_some());

        let noop = build_cache(CacheBackend::Noop, 4);
        assert_eq!(noop.backend_name(), "noop");
        noop.put(row(1.0, 1.0));
        assert!(noop.get(row(1.0, 0.0).input()).is_none());
        assert!(noop.is_empty());
    }

    #[test]
    fn test_hit_rate_handles_empty_stats() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 1.0);

        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
