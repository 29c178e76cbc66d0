//! # Single-Series Engine
//!
//! Read/modify/write protocol for one time-bucketed counter series. A
//! series is an ordered run of rows, at most one per bucket, each holding
//! the bucket's delta and the running cumulative total up to and including
//! that bucket.
//!
//! Writers never lock. They read the latest row, pick an insert or an
//! update, and rely on the per-bucket unique key to detect a concurrent
//! writer that created the same bucket first. The loser of that race
//! retries once as an update.
//!
//! A back-dated write inserts a zero row at its bucket and then shifts the
//! cumulative of every row from that bucket onwards. A concurrent writer
//! that creates a newer bucket between those two statements computes its
//! cumulative from rows that do not yet include the back-dated amount. The
//! drift is repaired by [`Series::reconstruct`].
//!
//! Storage is reached through [`SeriesStorage`] so engines other than the
//! bundled SQLite backend can provide the same four primitives.

use crate::codec::{self, CodecError, MetricData};
use crate::error::{MetricError, Result};
use crate::precision::EventDatePrecision;
use log::{debug, warn};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Identifies the rows of one series.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SeriesKey {
    /// A metric of an entity, segmented by one dimension.
    Metric {
        id: Uuid,
        type_id: Uuid,
        symbol_id: i32,
        dimension_id: Uuid,
    },
    /// The counter of one dimension combination for one action.
    Count(CountSeries),
}

/// Columns of a count record row. Only `count_id` and `action_symbol_id`
/// identify the series; the rest are written on insert.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CountSeries {
    pub count_id: Uuid,
    pub action_symbol_id: i32,
    /// Entity the count belongs to, when counts are scoped per entity
    pub record_id: Option<Uuid>,
    pub type_id: Uuid,
    pub dimensions_symbol_id: i32,
    /// Stamped on every insert and update
    pub update_date: i64,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesKey::Metric {
                id,
                symbol_id,
                dimension_id,
                ..
            } => write!(f, "metric(id={}, symbol={}, dimension={})", id, symbol_id, dimension_id),
            SeriesKey::Count(count) => write!(
                f,
                "count(countId={}, action={})",
                count.count_id, count.action_symbol_id
            ),
        }
    }
}

/// Connection a read is served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadFrom {
    /// The write connection. Used inside read-modify-write sequences.
    Primary,
    /// A read-only connection, when one is configured.
    Replica,
}

/// Storage primitives a series engine needs.
///
/// Amounts are fixed-point micros. Bucket arguments are Unix milliseconds
/// and are matched on their minute prefix. Errors are returned bare; the
/// engine attaches the series key and operation.
pub trait SeriesStorage {
    /// Latest row, optionally restricted to buckets at or before a time.
    fn latest(&self, key: &SeriesKey, at_or_before: Option<i64>, from: ReadFrom) -> Result<Option<MetricData>>;

    /// `(latest, earliest)` rows with buckets after `after` and, if given,
    /// at or before `at_or_before`.
    fn window(
        &self,
        key: &SeriesKey,
        after: i64,
        at_or_before: Option<i64>,
        from: ReadFrom,
    ) -> Result<Option<(MetricData, MetricData)>>;

    /// Every row in bucket order.
    fn rows(&self, key: &SeriesKey) -> Result<Vec<MetricData>>;

    /// Insert a new row. A row already holding the bucket must surface as
    /// an error for which [`MetricError::is_duplicate_key`] is true.
    fn insert(&self, key: &SeriesKey, data: &MetricData) -> Result<()>;

    /// Add `amount` to delta and cumulative of the row at `bucket`.
    fn add_at(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize>;

    /// Add `amount` to the cumulative of every row at or after `bucket`,
    /// and to the delta of the row exactly at `bucket`.
    fn add_from(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize>;

    /// Overwrite the row holding `data`'s bucket.
    fn replace(&self, key: &SeriesKey, data: &MetricData) -> Result<usize>;

    fn delete(&self, key: &SeriesKey) -> Result<usize>;
}

/// One series bound to its storage.
pub struct Series<'a, S: SeriesStorage + ?Sized> {
    storage: &'a S,
    key: SeriesKey,
    precision: EventDatePrecision,
}

impl<'a, S: SeriesStorage + ?Sized> Series<'a, S> {
    pub fn new(storage: &'a S, key: SeriesKey, precision: EventDatePrecision) -> Self {
        Self {
            storage,
            key,
            precision,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn precision(&self) -> EventDatePrecision {
        self.precision
    }

    fn context(&self, op: &'static str) -> impl Fn(MetricError) -> MetricError + '_ {
        move |e| e.in_series(op, &self.key)
    }

    /// Add `amount` micros to the bucket starting at `bucket`. A zero
    /// amount writes nothing.
    pub fn increment(&self, amount: i64, bucket: i64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let minutes = codec::event_minutes(bucket)?;
        let latest = self
            .storage
            .latest(&self.key, None, ReadFrom::Primary)
            .map_err(self.context("increment"))?;

        match latest.map(|data| data.event_minutes().cmp(&minutes)) {
            None | Some(Ordering::Less) => {
                let previous = latest.map_or(0, |data| data.cumulative_micros());
                self.insert_bucket(previous, amount, bucket)
            }
            Some(Ordering::Equal) => self.add_to_existing(amount, bucket),
            Some(Ordering::Greater) => self.increment_backdated(amount, bucket),
        }
    }

    /// Increment the current bucket. The bucket-exact update is tried
    /// first since the row usually exists already; no read is needed then.
    pub fn increment_current(&self, amount: i64, bucket: i64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let updated = self
            .storage
            .add_at(&self.key, bucket, amount)
            .map_err(self.context("increment"))?;
        if updated == 1 {
            return Ok(());
        }
        self.increment(amount, bucket)
    }

    fn insert_bucket(&self, previous: i64, amount: i64, bucket: i64) -> Result<()> {
        let cumulative = previous.checked_add(amount).ok_or(CodecError::Overflow)?;
        let data = MetricData::from_micros(bucket, cumulative, amount)?;
        match self.storage.insert(&self.key, &data) {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate_key() => {
                debug!("{}: lost insert race for bucket {}, updating instead", self.key, bucket);
                let updated = self
                    .storage
                    .add_at(&self.key, bucket, amount)
                    .map_err(self.context("increment"))?;
                if updated == 1 {
                    Ok(())
                } else {
                    Err(e.in_series("increment", &self.key))
                }
            }
            Err(e) => Err(e.in_series("increment", &self.key)),
        }
    }

    fn add_to_existing(&self, amount: i64, bucket: i64) -> Result<()> {
        let updated = self
            .storage
            .add_at(&self.key, bucket, amount)
            .map_err(self.context("increment"))?;
        if updated == 0 {
            // The row was removed between the read and the update.
            warn!("{}: bucket {} disappeared during increment", self.key, bucket);
            let previous = self
                .storage
                .latest(&self.key, Some(bucket), ReadFrom::Primary)
                .map_err(self.context("increment"))?;
            return self.insert_bucket(previous.map_or(0, |d| d.cumulative_micros()), amount, bucket);
        }
        Ok(())
    }

    fn increment_backdated(&self, amount: i64, bucket: i64) -> Result<()> {
        let minutes = codec::event_minutes(bucket)?;
        let prior = self
            .storage
            .latest(&self.key, Some(bucket), ReadFrom::Primary)
            .map_err(self.context("increment"))?;

        if !prior.is_some_and(|data| data.event_minutes() == minutes) {
            let base = prior.map_or(0, |data| data.cumulative_micros());
            let zero = MetricData::from_micros(bucket, base, 0)?;
            match self.storage.insert(&self.key, &zero) {
                Ok(()) => {}
                // Someone else created the bucket; the update below covers it.
                Err(e) if e.is_duplicate_key() => {}
                Err(e) => return Err(e.in_series("increment", &self.key)),
            }
        }

        self.storage
            .add_from(&self.key, bucket, amount)
            .map_err(self.context("increment"))?;
        Ok(())
    }

    /// Overwrite the single row of a series that has no time buckets.
    pub fn set(&self, amount: i64) -> Result<()> {
        if self.precision != EventDatePrecision::None {
            return Err(MetricError::SetRequiresNoPrecision(self.precision));
        }
        let data = MetricData::from_micros(0, amount, amount)?;
        let updated = self
            .storage
            .replace(&self.key, &data)
            .map_err(self.context("set"))?;
        if updated > 0 {
            return Ok(());
        }

        match self.storage.insert(&self.key, &data) {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate_key() => {
                let updated = self
                    .storage
                    .replace(&self.key, &data)
                    .map_err(self.context("set"))?;
                if updated == 1 {
                    Ok(())
                } else {
                    Err(e.in_series("set", &self.key))
                }
            }
            Err(e) => Err(e.in_series("set", &self.key)),
        }
    }

    /// Sum of deltas for buckets after `start` and at or before `end`.
    ///
    /// Without a start this is the cumulative of the latest row at or
    /// before `end`. `None` when no row matches.
    pub fn read(&self, start: Option<i64>, end: Option<i64>) -> Result<Option<i64>> {
        match start {
            None => Ok(self.latest_at(end)?.map(|data| data.cumulative_micros())),
            Some(start) => self
                .window_bounds(start, end)?
                .map(|(max, min)| window_sum(&max, &min))
                .transpose(),
        }
    }

    /// Latest row at or before `end`, or the latest row overall.
    pub fn latest_at(&self, end: Option<i64>) -> Result<Option<MetricData>> {
        self.storage
            .latest(&self.key, end, ReadFrom::Replica)
            .map_err(self.context("read"))
    }

    /// Latest row read through the write connection, for read-modify-write
    /// sequences.
    pub fn latest_for_update(&self) -> Result<Option<MetricData>> {
        self.storage
            .latest(&self.key, None, ReadFrom::Primary)
            .map_err(self.context("read"))
    }

    /// `(latest, earliest)` rows after `start` and at or before `end`.
    pub fn window_bounds(&self, start: i64, end: Option<i64>) -> Result<Option<(MetricData, MetricData)>> {
        self.storage
            .window(&self.key, start, end, ReadFrom::Replica)
            .map_err(self.context("read"))
    }

    pub fn delete(&self) -> Result<usize> {
        self.storage.delete(&self.key).map_err(self.context("delete"))
    }

    /// Recompute cumulative amounts from deltas, rewriting rows that
    /// disagree. Returns the number of rows fixed.
    pub fn reconstruct(&self) -> Result<usize> {
        let rows = self
            .storage
            .rows(&self.key)
            .map_err(self.context("reconstruct"))?;

        let mut last_correct: i64 = 0;
        let mut fixed = 0;
        for data in rows {
            let cumulative = data.cumulative_micros();
            let delta = data.delta_micros();
            let mut correct = cumulative;
            if cumulative.checked_sub(last_correct) != Some(delta) {
                correct = last_correct.checked_add(delta).ok_or(CodecError::Overflow)?;
            }
            if correct != cumulative {
                let repaired = MetricData::from_micros(data.event_millis(), correct, delta)?;
                self.storage
                    .replace(&self.key, &repaired)
                    .map_err(self.context("reconstruct"))?;
                fixed += 1;
            }
            last_correct = correct;
        }

        if fixed > 0 {
            warn!("{}: reconstructed {} cumulative amounts", self.key, fixed);
        }
        Ok(fixed)
    }
}

/// `maxCumulative − minCumulative + minDelta`: the deltas of every bucket
/// from the earliest to the latest row, inclusive.
pub fn window_sum(max: &MetricData, min: &MetricData) -> Result<i64> {
    max.cumulative_micros()
        .checked_sub(min.cumulative_micros())
        .and_then(|v| v.checked_add(min.delta_micros()))
        .ok_or(MetricError::Codec(CodecError::Overflow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use crate::types::ZERO_ID;

    const T0: i64 = 1_710_028_800_000;
    const HOUR: i64 = 3_600_000;
    const UNIT: i64 = 1_000_000;

    fn key() -> SeriesKey {
        SeriesKey::Metric {
            id: Uuid::from_u128(1),
            type_id: Uuid::from_u128(2),
            symbol_id: 3,
            dimension_id: ZERO_ID,
        }
    }

    fn cumulatives(store: &SqliteStore) -> Vec<(i64, i64, i64)> {
        store
            .rows(&key())
            .unwrap()
            .iter()
            .map(|d| (d.event_millis(), d.cumulative_micros() / UNIT, d.delta_micros() / UNIT))
            .collect()
    }

    #[test]
    fn test_increments_append_and_accumulate() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let series = Series::new(&store, key(), EventDatePrecision::Hour);

        series.increment(2 * UNIT, T0)?;
        series.increment(3 * UNIT, T0)?;
        series.increment(UNIT, T0 + HOUR)?;

        assert_eq!(cumulatives(&store), vec![(T0, 5, 5), (T0 + HOUR, 6, 1)]);
        assert_eq!(series.read(None, None)?, Some(6 * UNIT));
        Ok(())
    }

    #[test]
    fn test_backdated_increment_shifts_later_rows() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let series = Series::new(&store, key(), EventDatePrecision::Hour);

        series.increment(UNIT, T0)?;
        series.increment(UNIT, T0 + 3 * HOUR)?;
        series.increment(4 * UNIT, T0 + HOUR)?;
        series.increment(10 * UNIT, T0)?;

        assert_eq!(
            cumulatives(&store),
            vec![(T0, 11, 11), (T0 + HOUR, 15, 4), (T0 + 3 * HOUR, 16, 1)]
        );
        assert_eq!(series.reconstruct()?, 0);
        Ok(())
    }

    #[test]
    fn test_window_reads() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let series = Series::new(&store, key(), EventDatePrecision::Hour);
        for (i, amount) in [1, 2, 4, 8].into_iter().enumerate() {
            series.increment(amount * UNIT, T0 + i as i64 * HOUR)?;
        }

        // Start is exclusive, end inclusive.
        assert_eq!(series.read(Some(T0), None)?, Some(14 * UNIT));
        assert_eq!(series.read(Some(T0), Some(T0 + 2 * HOUR))?, Some(6 * UNIT));
        assert_eq!(series.read(None, Some(T0 + HOUR))?, Some(3 * UNIT));
        assert_eq!(series.read(Some(T0 + 3 * HOUR), None)?, None);
        assert_eq!(series.read(None, Some(T0 - HOUR))?, None);
        Ok(())
    }

    #[test]
    fn test_increment_current_creates_missing_bucket() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let series = Series::new(&store, key(), EventDatePrecision::Hour);

        series.increment_current(UNIT, T0)?;
        series.increment_current(UNIT, T0)?;
        series.increment_current(UNIT, T0 + HOUR)?;

        assert_eq!(cumulatives(&store), vec![(T0, 2, 2), (T0 + HOUR, 3, 1)]);
        Ok(())
    }

    #[test]
    fn test_set_requires_no_precision() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let hourly = Series::new(&store, key(), EventDatePrecision::Hour);
        assert!(matches!(
            hourly.set(UNIT),
            Err(MetricError::SetRequiresNoPrecision(EventDatePrecision::Hour))
        ));

        let total = Series::new(&store, key(), EventDatePrecision::None);
        total.set(7 * UNIT)?;
        total.set(7 * UNIT)?;
        assert_eq!(total.read(None, None)?, Some(7 * UNIT));
        total.set(-2 * UNIT)?;
        assert_eq!(cumulatives(&store), vec![(0, -2, -2)]);
        Ok(())
    }

    #[test]
    fn test_reconstruct_repairs_drift() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        store.insert(&key(), &MetricData::from_micros(T0, UNIT, UNIT)?)?;
        store.insert(&key(), &MetricData::from_micros(T0 + HOUR, 2 * UNIT, 3 * UNIT)?)?;
        store.insert(&key(), &MetricData::from_micros(T0 + 2 * HOUR, 8 * UNIT, 5 * UNIT)?)?;

        let series = Series::new(&store, key(), EventDatePrecision::Hour);
        assert_eq!(series.reconstruct()?, 2);
        assert_eq!(
            cumulatives(&store),
            vec![(T0, 1, 1), (T0 + HOUR, 4, 3), (T0 + 2 * HOUR, 9, 5)]
        );
        Ok(())
    }

    #[test]
    fn test_zero_increment_writes_nothing() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let series = Series::new(&store, key(), EventDatePrecision::Hour);

        series.increment(0, T0)?;
        series.increment_current(0, T0 + HOUR)?;
        assert!(cumulatives(&store).is_empty());

        series.increment(UNIT, T0)?;
        series.increment(0, T0 + HOUR)?;
        assert_eq!(cumulatives(&store), vec![(T0, 1, 1)]);
        Ok(())
    }

    /// Serves replica reads from an empty series, as a lagging read-only
    /// connection would.
    struct LaggingReplica<'a> {
        primary: &'a SqliteStore,
    }

    impl SeriesStorage for LaggingReplica<'_> {
        fn latest(&self, key: &SeriesKey, at_or_before: Option<i64>, from: ReadFrom) -> Result<Option<MetricData>> {
            match from {
                ReadFrom::Primary => self.primary.latest(key, at_or_before, from),
                ReadFrom::Replica => Ok(None),
            }
        }

        fn window(
            &self,
            _key: &SeriesKey,
            _after: i64,
            _at_or_before: Option<i64>,
            _from: ReadFrom,
        ) -> Result<Option<(MetricData, MetricData)>> {
            Ok(None)
        }

        fn rows(&self, key: &SeriesKey) -> Result<Vec<MetricData>> {
            self.primary.rows(key)
        }

        fn insert(&self, key: &SeriesKey, data: &MetricData) -> Result<()> {
            self.primary.insert(key, data)
        }

        fn add_at(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize> {
            self.primary.add_at(key, bucket, amount)
        }

        fn add_from(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize> {
            self.primary.add_from(key, bucket, amount)
        }

        fn replace(&self, key: &SeriesKey, data: &MetricData) -> Result<usize> {
            self.primary.replace(key, data)
        }

        fn delete(&self, key: &SeriesKey) -> Result<usize> {
            self.primary.delete(key)
        }
    }

    #[test]
    fn test_latest_for_update_reads_primary() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let lagging = LaggingReplica { primary: &store };
        let series = Series::new(&lagging, key(), EventDatePrecision::None);
        series.set(5 * UNIT)?;

        assert_eq!(series.latest_at(None)?, None);
        assert_eq!(
            series.latest_for_update()?.map(|d| d.cumulative_micros()),
            Some(5 * UNIT)
        );
        Ok(())
    }

    #[test]
    fn test_delete_removes_series() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let series = Series::new(&store, key(), EventDatePrecision::Hour);
        series.increment(UNIT, T0)?;
        series.increment(UNIT, T0 + HOUR)?;

        assert_eq!(series.delete()?, 2);
        assert_eq!(series.read(None, None)?, None);
        Ok(())
    }
}
