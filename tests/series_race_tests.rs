//! Concurrency tests for the single-series write protocol.
//!
//! A wrapper backend lets a simulated competitor write between the
//! engine's read and its insert, so the insert-then-update retry can be
//! exercised deterministically.

use metric_store::precision::EventDatePrecision;
use metric_store::series::ReadFrom;
use metric_store::storage::SymbolTable;
use metric_store::{
    Calendar, DimensionResolver, EntityRef, MetricData, MetricDatabase, Result, Series, SeriesKey, SeriesStorage,
    SqliteStore, ZERO_ID,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

const HOUR: i64 = 3_600_000;
const BASE: i64 = 1_699_999_200_000;

/// Delegates to SQLite, but lets a competitor insert its own row for the
/// bucket right before the engine's first insert lands.
struct RacingStore {
    inner: Arc<SqliteStore>,
    competitor: Mutex<Option<MetricData>>,
    /// Report zero updated rows from `add_at`, as if the row vanished
    lose_updates: bool,
}

impl SeriesStorage for RacingStore {
    fn latest(&self, key: &SeriesKey, at_or_before: Option<i64>, from: ReadFrom) -> Result<Option<MetricData>> {
        self.inner.latest(key, at_or_before, from)
    }

    fn window(
        &self,
        key: &SeriesKey,
        after: i64,
        at_or_before: Option<i64>,
        from: ReadFrom,
    ) -> Result<Option<(MetricData, MetricData)>> {
        self.inner.window(key, after, at_or_before, from)
    }

    fn rows(&self, key: &SeriesKey) -> Result<Vec<MetricData>> {
        self.inner.rows(key)
    }

    fn insert(&self, key: &SeriesKey, data: &MetricData) -> Result<()> {
        let competitor = self.competitor.lock().take();
        if let Some(competitor) = competitor {
            self.inner.insert(key, &competitor)?;
        }
        self.inner.insert(key, data)
    }

    fn add_at(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize> {
        if self.lose_updates {
            return Ok(0);
        }
        self.inner.add_at(key, bucket, amount)
    }

    fn add_from(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize> {
        self.inner.add_from(key, bucket, amount)
    }

    fn replace(&self, key: &SeriesKey, data: &MetricData) -> Result<usize> {
        self.inner.replace(key, data)
    }

    fn delete(&self, key: &SeriesKey) -> Result<usize> {
        self.inner.delete(key)
    }
}

fn series_key(store: &SqliteStore) -> SeriesKey {
    SeriesKey::Metric {
        id: Uuid::from_u128(7),
        type_id: Uuid::from_u128(1),
        symbol_id: store.symbol_id("views").unwrap(),
        dimension_id: ZERO_ID,
    }
}

fn racing(competitor: MetricData, lose_updates: bool) -> RacingStore {
    RacingStore {
        inner: Arc::new(SqliteStore::in_memory().unwrap()),
        competitor: Mutex::new(Some(competitor)),
        lose_updates,
    }
}

#[test]
fn test_concurrent_first_insert_keeps_both_amounts() {
    let store = racing(MetricData::encode(BASE, 3.0, 3.0).unwrap(), false);
    let key = series_key(&store.inner);
    let series = Series::new(&store, key.clone(), EventDatePrecision::Hour);

    series.increment(4_000_000, BASE).unwrap();

    let rows = store.rows(&key).unwrap();
    assert_eq!(rows.len(), 1, "exactly one row per bucket");
    assert_eq!(rows[0].cumulative(), 7.0);
    assert_eq!(rows[0].delta(), 7.0);
}

#[test]
fn test_failed_retry_surfaces_original_error() {
    let store = racing(MetricData::encode(BASE, 3.0, 3.0).unwrap(), true);
    let key = series_key(&store.inner);
    let series = Series::new(&store, key.clone(), EventDatePrecision::Hour);

    let err = series.increment(4_000_000, BASE).unwrap_err();
    assert!(err.is_duplicate_key());
    assert!(err.to_string().contains("increment"));

    // The competitor's row is untouched.
    let rows = store.rows(&key).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].cumulative(), 3.0);
}

#[test]
fn test_competitor_at_later_bucket_during_first_write() {
    // The competitor creates a later bucket; ours still inserts cleanly
    // and the later row is left for reconstruction to reconcile.
    let store = racing(MetricData::encode(BASE + HOUR, 3.0, 3.0).unwrap(), false);
    let key = series_key(&store.inner);
    let series = Series::new(&store, key.clone(), EventDatePrecision::Hour);

    series.increment(1_000_000, BASE).unwrap();
    assert_eq!(series.reconstruct().unwrap(), 1);

    let rows = store.rows(&key).unwrap();
    let cumulative: Vec<f64> = rows.iter().map(|r| r.cumulative()).collect();
    assert_eq!(cumulative, vec![1.0, 4.0]);
}

#[test]
fn test_threads_incrementing_one_bucket() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let dimensions = Arc::new(DimensionResolver::new(store.clone(), 100));
    let type_id = Uuid::from_u128(1);
    let views = Arc::new(
        MetricDatabase::new(store, dimensions, type_id, "views")
            .with_precision(EventDatePrecision::Hour)
            .with_calendar(Calendar::Utc),
    );
    let entity = EntityRef::new(Uuid::from_u128(7), type_id);

    let mut handles = vec![];
    for _ in 0..8 {
        let views = Arc::clone(&views);
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                views.increment(&entity, Some("US"), Some(BASE), 1.0).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(views.metric_sum(&entity, None, None).unwrap(), Some(200.0));
    assert_eq!(views.metric(&entity, Some("US"), None, None).unwrap(), Some(200.0));
    assert_eq!(views.reconstruct(&entity).unwrap(), 0);
}
