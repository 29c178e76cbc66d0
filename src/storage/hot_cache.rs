//! # Hot Cache
//!
//! Bounded in-memory map with least-recently-used eviction. When an insert
//! would exceed capacity, the oldest tenth of the entries (at least one)
//! is dropped in a single eviction pass.
//!
//! Recency is tracked with a monotonic tick rather than wall-clock time, so
//! two accesses in the same millisecond are still ordered.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Capacity used by [`HotCache::new`].
pub const DEFAULT_CAPACITY: usize = 10_000;

struct Slot<V> {
    value: V,
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// tick → key, oldest first
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    total_evictions: u64,
    total_evicted: u64,
}

impl<K: Clone + Eq + Hash, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.clone());
            self.next_tick += 1;
        }
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut evicted = 0;
        while evicted < count {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        if evicted > 0 {
            self.total_evictions += 1;
            self.total_evicted += evicted as u64;
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default)]
pub struct HotCacheStats {
    /// Entries currently cached
    pub entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Number of eviction passes
    pub total_evictions: u64,
    /// Number of entries removed by eviction passes
    pub total_evicted: u64,
}

/// Thread-safe bounded LRU map.
pub struct HotCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Clone + Eq + Hash, V: Clone> HotCache<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                recency: BTreeMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
                total_evictions: 0,
                total_evicted: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace. Replacing refreshes the entry's recency.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.entries.get_mut(&key) {
            slot.value = value;
            inner.touch(&key);
            return;
        }

        if inner.entries.len() >= self.capacity {
            let batch = (self.capacity / 10).max(1);
            inner.evict_oldest(batch);
        }

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(key, Slot { value, tick });
    }

    /// Look up without changing recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(key).map(|slot| slot.value.clone());
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Look up and mark the entry as most recently used.
    pub fn get_and_mark(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(key).map(|slot| slot.value.clone());
        if found.is_some() {
            inner.hits += 1;
            inner.touch(key);
        } else {
            inner.misses += 1;
        }
        found
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let slot = inner.entries.remove(key)?;
        inner.recency.remove(&slot.tick);
        Some(slot.value)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HotCacheStats {
        let inner = self.inner.lock();
        HotCacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            total_evictions: inner.total_evictions,
            total_evicted: inner.total_evicted,
        }
    }
}

impl<K: Clone + Eq + Hash, V: Clone> Default for HotCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
