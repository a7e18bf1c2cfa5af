use parking_lot::Mutex;
use sg_types::{InputRow, Row};
use std::collections::HashMap;

use crate::{CacheStats, ResultCache};

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    row: Row,
    prev: usize,
    next: usize,
}

/// Slab of nodes linked most-recent-first, plus a hash index into the slab.
///
/// Slots are only ever appended until the capacity is reached; after that
/// the tail slot is recycled in place on every eviction.
#[derive(Debug)]
struct LruList {
    index: HashMap<InputRow, usize>,
    nodes: Vec<Node>,
    head: usize,
    tail: usize,
    capacity: usize,
    stats: CacheStats,
}

impl LruList {
    fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::new(),
            nodes: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
            stats: CacheStats::default(),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn get(&mut self, input: &InputRow) -> Option<Row> {
        match self.index.get(input).copied() {
            Some(idx) => {
                self.touch(idx);
                self.stats.hits += 1;
                Some(self.nodes[idx].row.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, row: Row) {
        if self.capacity == 0 {
            return;
        }
        self.stats.stores += 1;

        if let Some(idx) = self.index.get(row.input()).copied() {
            self.nodes[idx].row = row;
            self.touch(idx);
            return;
        }

        let key = row.input().clone();
        if self.nodes.len() < self.capacity {
            self.nodes.push(Node {
                row,
                prev: NIL,
                next: NIL,
            });
            let idx = self.nodes.len() - 1;
            self.push_front(idx);
            self.index.insert(key, idx);
        } else {
            let idx = self.tail;
            self.unlink(idx);
            self.index.remove(self.nodes[idx].row.input());
            self.nodes[idx].row = row;
            self.push_front(idx);
            self.index.insert(key, idx);
            self.stats.evictions += 1;
        }
    }

    /// Inputs from most to least recently used.
    fn order(&self) -> Vec<InputRow> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while cursor != NIL {
            out.push(self.nodes[cursor].row.input().clone());
            cursor = self.nodes[cursor].next;
        }
        out
    }
}

/// Bounded in-memory least-recently-used cache.
///
/// One mutex guards both the index and the recency list, so the recency
/// update of a hit happens atomically with the lookup and concurrent
/// callers observe a single real-time LRU order.
#[derive(Debug)]
pub struct LruCache {
    inner: Mutex<LruList>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruList::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Whether `input` is cached, without counting as a use.
    pub fn contains(&self, input: &InputRow) -> bool {
        self.inner.lock().index.contains_key(input)
    }

    /// Cached inputs from most to least recently used.
    pub fn recency_order(&self) -> Vec<InputRow> {
        self.inner.lock().order()
    }
}

impl ResultCache for LruCache {
    fn get(&self, input: &InputRow) -> Option<Row> {
        self.inner.lock().get(input)
    }

    fn put(&self, row: Row) {
        self.inner.lock().put(row);
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    fn backend_name(&self) -> &'static str {
        "lru"
    }
}
