use sg_types::{InputRow, Row};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{CacheStats, ResultCache};

/// Pass-through cache: every lookup misses and writes are discarded.
#[derive(Debug, Default)]
pub struct NoopCache {
    misses: AtomicU64,
}

impl NoopCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCache for NoopCache {
    fn get(&self, _input: &InputRow) -> Option<Row> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn put(&self, _row: Row) {}

    fn len(&self) -> usize {
        0
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn backend_name(&self) -> &'static str {
        "noop"
    }
}
