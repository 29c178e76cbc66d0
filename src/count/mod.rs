//! # Count Records
//!
//! Counters keyed by a combination of dimension values rather than a
//! single dimension. Each distinct combination of an action gets its own
//! `countId`; the counter row and one row per (field, value) pair in the
//! index tables share it.
//!
//! A [`CountRecord`] resolves its `countId` lazily. When no stored
//! combination matches, a fresh id is minted and nothing is written until
//! the first increment, which stores the counter row and every dimension
//! row in one transaction. Later mutations go straight to the series
//! engine.

pub mod dimension;
pub mod query;

pub use dimension::{Dimension, DimensionSet, DimensionValue, FieldDescriptor, IndexTable, ValueKind};

use crate::codec::{self, CodecError, MetricData};
use crate::error::{MetricError, Result};
use crate::ids;
use crate::precision::{Calendar, EventDatePrecision};
use crate::series::{CountSeries, Series, SeriesKey};
use crate::storage::{SqliteStore, SymbolTable};
use crate::types::{now_ms, EntityRef};
use log::debug;
use query::CountQuery;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Field on the entity's type that mirrors the entity's own count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryField {
    pub owner: String,
    pub internal_name: String,
    /// Summary table; the store's configured table when `None`
    pub table: Option<String>,
    pub column: String,
}

impl SummaryField {
    pub fn new(owner: impl Into<String>, internal_name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            internal_name: internal_name.into(),
            table: None,
            column: "value".to_string(),
        }
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Interned name of the field, `owner/internal_name`.
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.owner, self.internal_name)
    }
}

/// The count of one action for one combination of dimension values.
pub struct CountRecord {
    store: Arc<SqliteStore>,
    entity: EntityRef,
    action: String,
    dimensions: DimensionSet,
    precision: EventDatePrecision,
    calendar: Calendar,
    include_self_dimension: bool,
    summary_field: Option<SummaryField>,
    count_id: Option<Uuid>,
    dimensions_saved: bool,
    update_date: Option<i64>,
    event_date: Option<i64>,
    query_start: Option<i64>,
    query_end: Option<i64>,
}

impl CountRecord {
    pub fn new(
        store: Arc<SqliteStore>,
        entity: EntityRef,
        action: impl Into<String>,
        dimensions: DimensionSet,
    ) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(MetricError::EmptyDimensions);
        }
        let calendar = store.config().calendar;
        Ok(Self {
            store,
            entity,
            action: action.into(),
            dimensions,
            precision: EventDatePrecision::None,
            calendar,
            include_self_dimension: false,
            summary_field: None,
            count_id: None,
            dimensions_saved: false,
            update_date: None,
            event_date: None,
            query_start: None,
            query_end: None,
        })
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn dimensions(&self) -> &DimensionSet {
        &self.dimensions
    }

    pub fn precision(&self) -> EventDatePrecision {
        self.precision
    }

    pub fn set_precision(&mut self, precision: EventDatePrecision) {
        self.precision = precision;
    }

    pub fn set_calendar(&mut self, calendar: Calendar) {
        self.calendar = calendar;
    }

    /// Scope the count to the entity itself. Changing the scope drops the
    /// resolved `countId`.
    pub fn set_include_self_dimension(&mut self, include: bool) {
        if include != self.include_self_dimension {
            self.include_self_dimension = include;
            self.count_id = None;
            self.dimensions_saved = false;
        }
    }

    pub fn set_summary_field(&mut self, field: Option<SummaryField>) {
        self.summary_field = field;
    }

    /// Window used by [`CountRecord::count`]: buckets after `start` and at
    /// or before `end`.
    pub fn set_query_date_range(&mut self, start: Option<i64>, end: Option<i64>) {
        self.query_start = start;
        self.query_end = end;
    }

    pub fn set_update_date(&mut self, millis: i64) {
        self.update_date = Some(millis);
    }

    pub fn update_date(&self) -> i64 {
        self.update_date.unwrap_or_else(now_ms)
    }

    /// Event time of the next write, truncated to the record's precision.
    pub fn set_event_date(&mut self, millis: i64) -> Result<()> {
        self.event_date = Some(self.calendar.truncate(self.precision, millis)?);
        Ok(())
    }

    pub fn event_date(&self) -> Result<i64> {
        match self.event_date {
            Some(date) => Ok(date),
            None => self.calendar.truncate(self.precision, now_ms()),
        }
    }

    pub fn dimensions_symbol(&self) -> String {
        self.dimensions.symbol()
    }

    /// Entity id stored with rows; only set when the count is scoped to
    /// the entity.
    pub fn record_id(&self) -> Option<Uuid> {
        self.include_self_dimension.then_some(self.entity.id)
    }

    pub fn is_saved(&self) -> bool {
        self.dimensions_saved
    }

    fn field_symbols(&self) -> Result<HashMap<String, i32>> {
        let mut symbols = HashMap::with_capacity(self.dimensions.len());
        for dimension in self.dimensions.iter() {
            let key = dimension.key();
            let id = self.store.symbol_id(&key)?;
            symbols.insert(key, id);
        }
        Ok(symbols)
    }

    fn action_symbol_id(&self) -> Result<i32> {
        self.store.symbol_id(&self.action)
    }

    /// `countId` of the stored combination equal to this one, or a fresh
    /// id when there is none.
    pub fn count_id(&mut self) -> Result<Uuid> {
        if let Some(id) = self.count_id {
            return Ok(id);
        }

        let field_symbols = self.field_symbols()?;
        let query = CountQuery {
            dimensions: &self.dimensions,
            dimensions_symbol_id: self.store.symbol_id(&self.dimensions_symbol())?,
            action_symbol_id: self.action_symbol_id()?,
            record_id: self.record_id(),
            field_symbols: &field_symbols,
            start: None,
            end: None,
        };
        let id = match self.store.find_count_id(&query.count_id_sql(true)?)? {
            Some(id) => {
                self.dimensions_saved = true;
                id
            }
            None => {
                self.dimensions_saved = false;
                let id = ids::sequential_uuid();
                debug!("minted countId {} for {}", id, self.dimensions_symbol());
                id
            }
        };
        self.count_id = Some(id);
        Ok(id)
    }

    fn count_series(&self, count_id: Uuid) -> Result<CountSeries> {
        Ok(CountSeries {
            count_id,
            action_symbol_id: self.action_symbol_id()?,
            record_id: self.record_id(),
            type_id: self.entity.type_id,
            dimensions_symbol_id: self.store.symbol_id(&self.dimensions_symbol())?,
            update_date: self.update_date(),
        })
    }

    fn series(&self, count_id: Uuid) -> Result<Series<'_, SqliteStore>> {
        let key = SeriesKey::Count(self.count_series(count_id)?);
        Ok(Series::new(self.store.as_ref(), key, self.precision))
    }

    /// Current count over the query date range. Reads the saved `countId`
    /// directly once the combination is known to be stored; otherwise sums
    /// every stored combination that carries all of this one's values.
    pub fn count(&mut self) -> Result<Option<f64>> {
        let micros = if self.dimensions_saved {
            let count_id = self.count_id()?;
            self.series(count_id)?.read(self.query_start, self.query_end)?
        } else {
            let field_symbols = self.field_symbols()?;
            let query = CountQuery {
                dimensions: &self.dimensions,
                dimensions_symbol_id: self.store.symbol_id(&self.dimensions_symbol())?,
                action_symbol_id: self.action_symbol_id()?,
                record_id: self.record_id(),
                field_symbols: &field_symbols,
                start: self.query_start,
                end: self.query_end,
            };
            self.store.sum_counts(&query.count_sum_sql()?)?
        };
        Ok(micros.map(codec::from_micros))
    }

    /// Add `amount` at the record's event date. A zero amount is ignored.
    pub fn increment_count(&mut self, amount: f64) -> Result<()> {
        if amount == 0.0 {
            return Ok(());
        }
        let micros = codec::to_micros(amount)?;
        let count_id = self.count_id()?;
        let bucket = self.event_date()?;

        if self.dimensions_saved {
            self.series(count_id)?.increment(micros, bucket)?;
        } else {
            self.insert_first(count_id, bucket, micros)?;
        }
        self.apply_summary(amount, true)
    }

    /// Overwrite the count. Only valid without time buckets. The summary
    /// moves by the difference to the previous count.
    pub fn set_count(&mut self, amount: f64) -> Result<()> {
        if self.precision != EventDatePrecision::None {
            return Err(MetricError::SetRequiresNoPrecision(self.precision));
        }
        let micros = codec::to_micros(amount)?;
        let count_id = self.count_id()?;

        let previous = if self.dimensions_saved {
            let series = self.series(count_id)?;
            let previous = series.latest_for_update()?.map_or(0, |data| data.cumulative_micros());
            series.set(micros)?;
            previous
        } else {
            self.insert_first(count_id, 0, micros)?;
            0
        };
        let change = micros.checked_sub(previous).ok_or(CodecError::Overflow)?;
        self.apply_summary(codec::from_micros(change), true)
    }

    fn insert_first(&mut self, count_id: Uuid, bucket: i64, micros: i64) -> Result<()> {
        let series = self.count_series(count_id)?;
        let data = MetricData::from_micros(bucket, micros, micros)?;
        let field_symbols = self.field_symbols()?;
        match self
            .store
            .insert_count(&series, &data, &self.dimensions, &field_symbols)
        {
            Ok(()) => {}
            // The counter row exists; its dimension rows were written with it.
            Err(e) if e.is_duplicate_key() => {
                self.dimensions_saved = true;
                return self.series(count_id)?.increment(micros, bucket);
            }
            Err(e) => return Err(e.in_series("insert", SeriesKey::Count(series))),
        }
        self.dimensions_saved = true;
        Ok(())
    }

    fn summary_target(&self) -> Option<(&SummaryField, &str)> {
        if !self.include_self_dimension {
            return None;
        }
        let field = self.summary_field.as_ref()?;
        let table = field
            .table
            .as_deref()
            .unwrap_or(self.store.config().summary_table.as_str());
        Some((field, table))
    }

    fn apply_summary(&self, amount: f64, increment: bool) -> Result<()> {
        let Some((field, table)) = self.summary_target() else {
            return Ok(());
        };
        let symbol_id = self.store.symbol_id(&field.symbol())?;
        if increment {
            self.store
                .add_summary(table, &field.column, &self.entity.id, symbol_id, amount)
        } else {
            self.store
                .set_summary(table, &field.column, &self.entity.id, symbol_id, amount)
        }
    }

    /// Mirrored summary value, when a summary is configured.
    pub fn summary_value(&self) -> Result<Option<f64>> {
        let Some((field, table)) = self.summary_target() else {
            return Ok(None);
        };
        let symbol_id = self.store.symbol_id(&field.symbol())?;
        self.store
            .summary_value(table, &field.column, &self.entity.id, symbol_id)
    }

    /// Rewrite the mirrored summary from the current count.
    pub fn sync_count_summary(&mut self) -> Result<()> {
        if self.summary_target().is_none() {
            return Ok(());
        }
        let count = self.count()?.unwrap_or(0.0);
        self.apply_summary(count, false)
    }

    /// Delete every count of this action in the record's scope, then the
    /// mirrored summary. Returns the number of counter rows removed.
    pub fn delete_count(&mut self) -> Result<usize> {
        let removed = self.store.delete_counts(
            self.record_id().as_ref(),
            self.action_symbol_id()?,
            &IndexTable::ALL,
        )?;
        if let Some((field, table)) = self.summary_target() {
            let symbol_id = self.store.symbol_id(&field.symbol())?;
            self.store
                .delete_summary(table, &field.column, &self.entity.id, symbol_id)?;
        }
        self.count_id = None;
        self.dimensions_saved = false;
        debug!("deleted {} counts of {} for {}", removed, self.action, self.entity.id);
        Ok(removed)
    }
}
