//! # Dimension Resolver
//!
//! Maps dimension value text to a stable id. The empty value is the metric
//! total and always maps to the zero id. Other values are looked up in a
//! bounded LRU cache, then in storage, and minted on first use.

use crate::error::Result;
use crate::ids;
use crate::storage::{DimensionValueStorage, HotCache, HotCacheStats};
use crate::types::ZERO_ID;
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

pub struct DimensionResolver<S: ?Sized> {
    storage: Arc<S>,
    cache: HotCache<String, Uuid>,
}

impl<S: DimensionValueStorage + ?Sized> DimensionResolver<S> {
    pub fn new(storage: Arc<S>, capacity: usize) -> Self {
        Self {
            storage,
            cache: HotCache::with_capacity(capacity),
        }
    }

    /// Id of `value`, creating the mapping if needed.
    pub fn resolve(&self, value: Option<&str>) -> Result<Uuid> {
        let value = match value {
            Some(v) if !v.is_empty() => v,
            _ => return Ok(ZERO_ID),
        };

        let key = value.to_string();
        if let Some(id) = self.cache.get_and_mark(&key) {
            return Ok(id);
        }

        let id = match self.storage.find_dimension_id(value)? {
            Some(id) => id,
            None => self.create(value)?,
        };
        self.cache.insert(key, id);
        Ok(id)
    }

    /// Id of `value` if it was ever recorded. Never creates a mapping.
    pub fn lookup(&self, value: Option<&str>) -> Result<Option<Uuid>> {
        let value = match value {
            Some(v) if !v.is_empty() => v,
            _ => return Ok(Some(ZERO_ID)),
        };
        let key = value.to_string();
        if let Some(id) = self.cache.get_and_mark(&key) {
            return Ok(Some(id));
        }
        let found = self.storage.find_dimension_id(value)?;
        if let Some(id) = found {
            self.cache.insert(key, id);
        }
        Ok(found)
    }

    fn create(&self, value: &str) -> Result<Uuid> {
        let id = ids::sequential_uuid();
        match self.storage.insert_dimension(id, value) {
            Ok(()) => {
                debug!("created dimension {} for {:?}", id, value);
                Ok(id)
            }
            Err(e) if e.is_duplicate_key() => {
                // Another writer created it first; use theirs.
                match self.storage.find_dimension_id(value)? {
                    Some(existing) => Ok(existing),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn cache_stats(&self) -> HotCacheStats {
        self.cache.stats()
    }
}
