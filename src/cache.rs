//! # Read Cache
//!
//! Per-entity cache of the raw rows behind metric reads. Entries are keyed
//! by metric, dimension and the read's time bounds, and remember misses
//! explicitly so an empty series is not queried again.
//!
//! Every entity has its own map behind its own lock. Loads for an entity
//! run under that lock. Any write to the entity detaches the whole map, so
//! a load can never store rows older than a write that already finished
//! invalidating, and entities nobody reads hold no memory.

use crate::codec::MetricData;
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Which row of a read a cache entry holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Latest row at or before the end
    Latest,
    /// Earliest row after the start
    Earliest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol_id: i32,
    pub dimension_id: Uuid,
    /// Window start; `None` for point reads
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub edge: Edge,
}

impl CacheKey {
    /// Key of the latest row at or before `end`.
    pub fn point(symbol_id: i32, dimension_id: Uuid, end: Option<i64>) -> Self {
        Self {
            symbol_id,
            dimension_id,
            start: None,
            end,
            edge: Edge::Latest,
        }
    }

    /// Keys of the latest and earliest rows of a window.
    pub fn window(symbol_id: i32, dimension_id: Uuid, start: i64, end: Option<i64>) -> (Self, Self) {
        let latest = Self {
            symbol_id,
            dimension_id,
            start: Some(start),
            end,
            edge: Edge::Latest,
        };
        (
            latest,
            Self {
                edge: Edge::Earliest,
                ..latest
            },
        )
    }
}

/// A cached row or a remembered miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cached {
    Present(MetricData),
    Absent,
}

impl Cached {
    pub fn data(self) -> Option<MetricData> {
        match self {
            Cached::Present(data) => Some(data),
            Cached::Absent => None,
        }
    }
}

impl From<Option<MetricData>> for Cached {
    fn from(data: Option<MetricData>) -> Self {
        data.map_or(Cached::Absent, Cached::Present)
    }
}

type EntityEntries = Arc<Mutex<HashMap<CacheKey, Cached>>>;

#[derive(Debug, Clone, Default)]
pub struct ReadCacheStats {
    /// Entities with a cache scope
    pub entities: usize,
    /// Entries across all entities
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
pub struct ReadCache {
    entities: RwLock<HashMap<Uuid, EntityEntries>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, entity: &Uuid) -> EntityEntries {
        if let Some(entries) = self.entities.read().get(entity) {
            return entries.clone();
        }
        self.entities
            .write()
            .entry(*entity)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    pub fn get(&self, entity: &Uuid, key: &CacheKey) -> Option<Cached> {
        let scope = self.entities.read().get(entity).cloned();
        let found = scope.and_then(|entries| entries.lock().get(key).copied());
        self.record(found.is_some());
        found
    }

    pub fn put(&self, entity: &Uuid, key: CacheKey, data: Option<MetricData>) {
        self.scope(entity).lock().insert(key, data.into());
    }

    /// Store several entries under one lock acquisition.
    pub fn put_all<I>(&self, entity: &Uuid, entries: I)
    where
        I: IntoIterator<Item = (CacheKey, Option<MetricData>)>,
    {
        let scope = self.scope(entity);
        let mut map = scope.lock();
        for (key, data) in entries {
            map.insert(key, data.into());
        }
    }

    /// Cached row for `key`, loading and remembering it on a miss.
    pub fn get_or_load<F>(&self, entity: &Uuid, key: CacheKey, load: F) -> Result<Option<MetricData>>
    where
        F: FnOnce() -> Result<Option<MetricData>>,
    {
        let scope = self.scope(entity);
        let mut map = scope.lock();
        if let Some(cached) = map.get(&key) {
            self.record(true);
            return Ok(cached.data());
        }
        self.record(false);
        let data = load()?;
        map.insert(key, data.into());
        Ok(data)
    }

    /// Window variant of [`ReadCache::get_or_load`]. Hits only when both
    /// edges are cached.
    pub fn get_or_load_window<F>(
        &self,
        entity: &Uuid,
        keys: (CacheKey, CacheKey),
        load: F,
    ) -> Result<Option<(MetricData, MetricData)>>
    where
        F: FnOnce() -> Result<Option<(MetricData, MetricData)>>,
    {
        let (latest_key, earliest_key) = keys;
        let scope = self.scope(entity);
        let mut map = scope.lock();
        if let (Some(latest), Some(earliest)) = (map.get(&latest_key), map.get(&earliest_key)) {
            self.record(true);
            return Ok(latest.data().zip(earliest.data()));
        }
        self.record(false);
        let bounds = load()?;
        map.insert(latest_key, bounds.map(|(max, _)| max).into());
        map.insert(earliest_key, bounds.map(|(_, min)| min).into());
        Ok(bounds)
    }

    /// Drop every entry of an entity along with its scope. Called after
    /// any write to it. A load still holding the old scope fills a map
    /// nobody reads again.
    pub fn invalidate(&self, entity: &Uuid) {
        self.entities.write().remove(entity);
    }

    pub fn stats(&self) -> ReadCacheStats {
        let entities = self.entities.read();
        ReadCacheStats {
            entities: entities.len(),
            entries: entities.values().map(|e| e.lock().len()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn row(cumulative: i64) -> MetricData {
        MetricData::from_micros(0, cumulative, cumulative).unwrap()
    }

    #[test]
    fn test_miss_is_remembered() -> Result<()> {
        let cache = ReadCache::new();
        let entity = Uuid::from_u128(1);
        let key = CacheKey::point(1, Uuid::nil(), None);
        let loads = Cell::new(0);

        for _ in 0..3 {
            let found = cache.get_or_load(&entity, key, || {
                loads.set(loads.get() + 1);
                Ok(None)
            })?;
            assert_eq!(found, None);
        }
        assert_eq!(loads.get(), 1);
        assert_eq!(cache.get(&entity, &key), Some(Cached::Absent));
        Ok(())
    }

    #[test]
    fn test_invalidate_clears_every_metric_of_entity() {
        let cache = ReadCache::new();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        cache.put(&a, CacheKey::point(1, Uuid::nil(), None), Some(row(1)));
        cache.put(&a, CacheKey::point(2, Uuid::nil(), Some(5)), Some(row(2)));
        cache.put(&b, CacheKey::point(1, Uuid::nil(), None), Some(row(3)));

        cache.invalidate(&a);

        assert_eq!(cache.get(&a, &CacheKey::point(1, Uuid::nil(), None)), None);
        assert_eq!(cache.get(&a, &CacheKey::point(2, Uuid::nil(), Some(5))), None);
        assert_eq!(
            cache.get(&b, &CacheKey::point(1, Uuid::nil(), None)),
            Some(Cached::Present(row(3)))
        );
    }

    #[test]
    fn test_window_needs_both_edges() -> Result<()> {
        let cache = ReadCache::new();
        let entity = Uuid::from_u128(1);
        let keys = CacheKey::window(1, Uuid::nil(), 0, Some(10));
        cache.put(&entity, keys.0, Some(row(5)));

        let loaded = cache.get_or_load_window(&entity, keys, || Ok(Some((row(5), row(2)))))?;
        assert_eq!(loaded, Some((row(5), row(2))));
        let cached = cache.get_or_load_window(&entity, keys, || panic!("should be cached"))?;
        assert_eq!(cached, Some((row(5), row(2))));

        // A window key never answers a point read.
        assert_eq!(cache.get(&entity, &CacheKey::point(1, Uuid::nil(), Some(10))), None);
        Ok(())
    }

    #[test]
    fn test_invalidate_drops_scope() {
        let cache = ReadCache::new();
        let entity = Uuid::from_u128(1);
        cache.put(&entity, CacheKey::point(1, Uuid::nil(), None), None);
        assert_eq!(cache.stats().entities, 1);
        assert_eq!(cache.stats().entries, 1);
        cache.invalidate(&entity);
        assert_eq!(cache.stats().entities, 0);
    }

    #[test]
    fn test_lookups_do_not_retain_entities() {
        let cache = ReadCache::new();
        let key = CacheKey::point(1, Uuid::nil(), None);
        for i in 0..1000 {
            let entity = Uuid::from_u128(i);
            assert_eq!(cache.get(&entity, &key), None);
            cache.invalidate(&entity);
        }

        let stats = cache.stats();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.misses, 1000);
    }

    #[test]
    fn test_load_racing_invalidation_is_discarded() -> Result<()> {
        let cache = ReadCache::new();
        let entity = Uuid::from_u128(1);
        let key = CacheKey::point(1, Uuid::nil(), None);

        // The write lands while the load is running.
        let stale = cache.get_or_load(&entity, key, || {
            cache.invalidate(&entity);
            Ok(Some(row(1)))
        });
        assert_eq!(stale?, Some(row(1)));
        assert_eq!(cache.get(&entity, &key), None);
        assert_eq!(cache.stats().entities, 0);
        Ok(())
    }
}
