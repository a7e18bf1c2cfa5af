//! Adapter for externally backed caches (key-value stores, databases).

use parking_lot::RwLock;
use sg_types::{CacheError, InputRow, Row};
use std::fmt;
use tracing::warn;

use crate::{CacheStats, ResultCache};

/// A fallible external store of evaluated rows.
pub trait CacheStore: Send + Sync {
    fn load(&self, input: &InputRow) -> Result<Option<Row>, CacheError>;

    fn store(&self, row: &Row) -> Result<(), CacheError>;

    fn len(&self) -> Result<usize, CacheError>;

    fn name(&self) -> &str;
}

/// Exposes a [`CacheStore`] as a [`ResultCache`].
///
/// Store failures never reach the pipeline: a failed load is a miss (the
/// worker evaluates directly) and a failed write is dropped. Both are logged
/// and counted in [`CacheStats::errors`].
pub struct StoreBackedCache<S> {
    store: S,
    stats: RwLock<CacheStats>,
}

impl<S: CacheStore> StoreBackedCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: CacheStore> fmt::Debug for StoreBackedCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBackedCache")
            .field("store", &self.store.name())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl<S: CacheStore> ResultCache for StoreBackedCache<S> {
    fn get(&self, input: &InputRow) -> Option<Row> {
        match self.store.load(input) {
            Ok(Some(row)) => {
                self.stats.write().hits += 1;
                Some(row)
            }
            Ok(None) => {
                self.stats.write().misses += 1;
                None
            }
            Err(e) => {
                warn!(store = %self.store.name(), error = %e, "cache load failed, treating as miss");
                let mut stats = self.stats.write();
                stats.errors += 1;
                stats.misses += 1;
                None
            }
        }
    }

    fn put(&self, row: Row) {
        match self.store.store(&row) {
            Ok(()) => self.stats.write().stores += 1,
            Err(e) => {
                warn!(store = %self.store.name(), error = %e, "cache write failed, dropping entry");
                self.stats.write().errors += 1;
            }
        }
    }

    fn len(&self) -> usize {
        self.store.len().unwrap_or(0)
    }

    fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    fn backend_name(&self) -> &'static str {
        "store"
    }
}
