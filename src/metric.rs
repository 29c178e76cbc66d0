//! # Metric Database
//!
//! Named counters attached to entities. A metric of an entity is a family
//! of series, one per dimension value, plus the total under the zero
//! dimension. Incrementing a dimension also increments the total, so the
//! total always equals the sum over dimensions.
//!
//! ```text
//! entity ─┬─ "views" ─┬─ total   [bucket rows...]
//!         │           ├─ "US"    [bucket rows...]
//!         │           └─ "CA"    [bucket rows...]
//!         └─ "likes" ─── total   [bucket rows...]
//! ```

use crate::cache::{CacheKey, ReadCache};
use crate::codec::{self, CodecError, MetricData};
use crate::dimension::DimensionResolver;
use crate::error::{MetricError, Result};
use crate::precision::{Calendar, EventDatePrecision};
use crate::series::{window_sum, Series, SeriesKey};
use crate::storage::{SqliteStore, SymbolTable};
use crate::types::{now_ms, EntityRef, ZERO_ID};
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// One metric definition, e.g. "views" on articles.
pub struct MetricDatabase {
    store: Arc<SqliteStore>,
    dimensions: Arc<DimensionResolver<SqliteStore>>,
    cache: Option<Arc<ReadCache>>,
    type_id: Uuid,
    symbol: String,
    precision: EventDatePrecision,
    calendar: Calendar,
    reject_future_events: bool,
}

impl MetricDatabase {
    /// A metric with no time buckets. Calendar and future-event policy
    /// come from the store's configuration.
    pub fn new(
        store: Arc<SqliteStore>,
        dimensions: Arc<DimensionResolver<SqliteStore>>,
        type_id: Uuid,
        symbol: impl Into<String>,
    ) -> Self {
        let calendar = store.config().calendar;
        let reject_future_events = store.config().reject_future_events;
        Self {
            store,
            dimensions,
            cache: None,
            type_id,
            symbol: symbol.into(),
            precision: EventDatePrecision::None,
            calendar,
            reject_future_events,
        }
    }

    pub fn with_precision(mut self, precision: EventDatePrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_calendar(mut self, calendar: Calendar) -> Self {
        self.calendar = calendar;
        self
    }

    /// Serve reads through `cache`. Writes through this metric invalidate
    /// the written entity in it.
    pub fn with_cache(mut self, cache: Arc<ReadCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn symbol_id(&self) -> Result<i32> {
        self.store.symbol_id(&self.symbol)
    }

    pub fn type_id(&self) -> Uuid {
        self.type_id
    }

    pub fn precision(&self) -> EventDatePrecision {
        self.precision
    }

    /// Bucket for an event at `time`, or now when no time is given.
    pub fn event_date(&self, time: Option<i64>) -> Result<i64> {
        let now = now_ms();
        if let Some(time) = time {
            if self.reject_future_events && time > now {
                return Err(MetricError::FutureEvent(time));
            }
        }
        self.calendar.truncate(self.precision, time.unwrap_or(now))
    }

    fn check_entity(&self, entity: &EntityRef) -> Result<()> {
        if entity.type_id != self.type_id {
            return Err(MetricError::Config(format!(
                "metric {} belongs to type {}, not {}",
                self.symbol, self.type_id, entity.type_id
            )));
        }
        Ok(())
    }

    /// The series of one dimension of this metric for `entity`.
    pub fn series(&self, entity: &EntityRef, dimension_id: Uuid) -> Result<Series<'_, SqliteStore>> {
        self.check_entity(entity)?;
        let key = SeriesKey::Metric {
            id: entity.id,
            type_id: entity.type_id,
            symbol_id: self.symbol_id()?,
            dimension_id,
        };
        Ok(Series::new(self.store.as_ref(), key, self.precision))
    }

    fn invalidate(&self, entity: &EntityRef) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&entity.id);
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Add `amount` to the metric at `time` (now when `None`) for a
    /// dimension value, and to the metric's total.
    pub fn increment(&self, entity: &EntityRef, dimension: Option<&str>, time: Option<i64>, amount: f64) -> Result<()> {
        let dimension_id = self.dimensions.resolve(dimension)?;
        self.increment_by_dimension_id(entity, dimension_id, time, amount)
    }

    pub fn increment_by_dimension_id(
        &self,
        entity: &EntityRef,
        dimension_id: Uuid,
        time: Option<i64>,
        amount: f64,
    ) -> Result<()> {
        let micros = codec::to_micros(amount)?;
        if micros == 0 {
            return Ok(());
        }
        let bucket = self.event_date(time)?;

        let result = self.write_increments(entity, dimension_id, micros, bucket, time.is_none());
        self.invalidate(entity);
        result
    }

    fn write_increments(
        &self,
        entity: &EntityRef,
        dimension_id: Uuid,
        micros: i64,
        bucket: i64,
        implicit: bool,
    ) -> Result<()> {
        self.write_increment(entity, dimension_id, micros, bucket, implicit)?;
        if dimension_id != ZERO_ID {
            self.write_increment(entity, ZERO_ID, micros, bucket, implicit)?;
        }
        Ok(())
    }

    fn write_increment(&self, entity: &EntityRef, dimension_id: Uuid, micros: i64, bucket: i64, implicit: bool) -> Result<()> {
        let series = self.series(entity, dimension_id)?;
        if implicit {
            series.increment_current(micros, bucket)
        } else {
            series.increment(micros, bucket)
        }
    }

    /// Overwrite the metric for a dimension value. Only valid for metrics
    /// without time buckets. Setting a dimension recomputes the total as
    /// the sum of every dimension.
    pub fn set(&self, entity: &EntityRef, dimension: Option<&str>, amount: f64) -> Result<()> {
        if self.precision != EventDatePrecision::None {
            return Err(MetricError::SetRequiresNoPrecision(self.precision));
        }
        let micros = codec::to_micros(amount)?;
        let dimension_id = self.dimensions.resolve(dimension)?;

        let result = self.write_set(entity, dimension_id, micros);
        self.invalidate(entity);
        result
    }

    fn write_set(&self, entity: &EntityRef, dimension_id: Uuid, micros: i64) -> Result<()> {
        self.series(entity, dimension_id)?.set(micros)?;
        if dimension_id == ZERO_ID {
            return Ok(());
        }
        let mut total: i64 = 0;
        for window in self.store.dimension_windows(entity, self.symbol_id()?, None, None)? {
            total = total
                .checked_add(window.max.cumulative_micros())
                .ok_or(CodecError::Overflow)?;
        }
        self.series(entity, ZERO_ID)?.set(total)
    }

    /// Remove every dimension of this metric for `entity`.
    pub fn delete(&self, entity: &EntityRef) -> Result<usize> {
        self.check_entity(entity)?;
        let removed = self.store.delete_metric(entity, self.symbol_id()?);
        self.invalidate(entity);
        removed
    }

    /// Repair cumulative amounts of every dimension. Returns the number of
    /// rows rewritten.
    pub fn reconstruct(&self, entity: &EntityRef) -> Result<usize> {
        self.check_entity(entity)?;
        let mut fixed = 0;
        for dimension_id in self.store.metric_dimension_ids(entity, self.symbol_id()?)? {
            fixed += self.series(entity, dimension_id)?.reconstruct()?;
        }
        self.invalidate(entity);
        Ok(fixed)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Metric value for a dimension value.
    ///
    /// With a start, the sum of buckets after `start` and at or before
    /// `end`; otherwise the running total at `end` (or now). `None` when
    /// nothing was recorded.
    pub fn metric(
        &self,
        entity: &EntityRef,
        dimension: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Option<f64>> {
        match self.dimensions.lookup(dimension)? {
            Some(dimension_id) => self.metric_by_dimension_id(entity, dimension_id, start, end),
            None => Ok(None),
        }
    }

    pub fn metric_by_dimension_id(
        &self,
        entity: &EntityRef,
        dimension_id: Uuid,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Option<f64>> {
        let micros = self.read_micros(entity, dimension_id, start, end)?;
        Ok(micros.map(codec::from_micros))
    }

    /// Total over all dimensions.
    pub fn metric_sum(&self, entity: &EntityRef, start: Option<i64>, end: Option<i64>) -> Result<Option<f64>> {
        self.metric_by_dimension_id(entity, ZERO_ID, start, end)
    }

    fn read_micros(
        &self,
        entity: &EntityRef,
        dimension_id: Uuid,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Option<i64>> {
        let series = self.series(entity, dimension_id)?;
        let Some(cache) = &self.cache else {
            return series.read(start, end);
        };

        let symbol_id = self.symbol_id()?;
        match start {
            None => {
                let key = CacheKey::point(symbol_id, dimension_id, end);
                let latest = cache.get_or_load(&entity.id, key, || series.latest_at(end))?;
                Ok(latest.map(|data| data.cumulative_micros()))
            }
            Some(start) => {
                let keys = CacheKey::window(symbol_id, dimension_id, start, end);
                let bounds = cache.get_or_load_window(&entity.id, keys, || series.window_bounds(start, end))?;
                bounds.map(|(max, min)| window_sum(&max, &min)).transpose()
            }
        }
    }

    /// Bucket timestamp of the most recent write.
    pub fn last_update(&self, entity: &EntityRef, dimension: Option<&str>) -> Result<Option<i64>> {
        let Some(dimension_id) = self.dimensions.lookup(dimension)? else {
            return Ok(None);
        };
        let latest = self.series(entity, dimension_id)?.latest_at(None)?;
        Ok(latest.map(|data| data.event_millis()))
    }

    /// Value of every dimension (excluding the total), keyed by dimension
    /// value.
    pub fn metric_values(
        &self,
        entity: &EntityRef,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<BTreeMap<String, f64>> {
        self.check_entity(entity)?;
        let mut values = BTreeMap::new();
        for window in self.store.dimension_windows(entity, self.symbol_id()?, start, end)? {
            let micros = match start {
                Some(_) => window_sum(&window.max, &window.min)?,
                None => window.max.cumulative_micros(),
            };
            values.insert(window.value, codec::from_micros(micros));
        }
        Ok(values)
    }

    /// Sum of buckets per `interval`, for buckets after `start` and at or
    /// before `end`. Keys are interval starts.
    pub fn timeline(
        &self,
        entity: &EntityRef,
        dimension: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
        interval: EventDatePrecision,
    ) -> Result<BTreeMap<i64, f64>> {
        let Some(dimension_id) = self.dimensions.lookup(dimension)? else {
            return Ok(BTreeMap::new());
        };
        let series = self.series(entity, dimension_id)?;
        let rows = self.store.rows_between(series.key(), start, end)?;

        let mut sums: BTreeMap<i64, i64> = BTreeMap::new();
        for data in rows {
            let bucket = self.calendar.truncate(interval, data.event_millis())?;
            let sum = sums.entry(bucket).or_insert(0);
            *sum = sum.checked_add(data.delta_micros()).ok_or(CodecError::Overflow)?;
        }
        Ok(sums
            .into_iter()
            .map(|(bucket, micros)| (bucket, codec::from_micros(micros)))
            .collect())
    }

    /// Fill the read cache for several metrics of one entity, dimension and
    /// window with a single query. Metrics without rows are cached as
    /// absent. Does nothing unless the first metric has a cache.
    pub fn prefetch(
        metrics: &[&MetricDatabase],
        entity: &EntityRef,
        dimension: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<()> {
        let Some(first) = metrics.first() else {
            return Ok(());
        };
        let Some(cache) = &first.cache else {
            return Ok(());
        };
        let Some(dimension_id) = first.dimensions.lookup(dimension)? else {
            return Ok(());
        };

        let mut symbol_ids = Vec::with_capacity(metrics.len());
        for metric in metrics {
            metric.check_entity(entity)?;
            symbol_ids.push(metric.symbol_id()?);
        }
        symbol_ids.sort_unstable();
        symbol_ids.dedup();
        let bounds = first
            .store
            .window_bounds_by_symbol(entity, &dimension_id, &symbol_ids, start, end)?;

        let mut entries: Vec<(CacheKey, Option<MetricData>)> = Vec::with_capacity(symbol_ids.len() * 2);
        for symbol_id in &symbol_ids {
            let found = bounds.get(symbol_id).copied();
            match start {
                None => entries.push((
                    CacheKey::point(*symbol_id, dimension_id, end),
                    found.map(|(max, _)| max),
                )),
                Some(start) => {
                    let (latest_key, earliest_key) = CacheKey::window(*symbol_id, dimension_id, start, end);
                    entries.push((latest_key, found.map(|(max, _)| max)));
                    entries.push((earliest_key, found.map(|(_, min)| min)));
                }
            }
        }
        debug!("prefetched {} metrics for {}", symbol_ids.len(), entity.id);
        cache.put_all(&entity.id, entries);
        Ok(())
    }
}
