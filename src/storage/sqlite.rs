//! # SQLite Store
//!
//! Bundled backend for metrics and count records. One primary connection
//! serves writes; an optional read-only connection to the same file serves
//! plain reads. Each connection sits behind its own mutex and is held only
//! for the duration of a single storage call.
//!
//! Two deterministic SQL functions are registered on every connection so
//! arithmetic on the packed 20-byte values happens inside one statement:
//!
//! - `metric_add(data, cumulative, delta)` returns `data` with both amounts
//!   shifted by the given micros
//! - `metric_amount(data, position)` returns the cumulative (`1`) or delta
//!   (`2`) micros of `data`, or NULL for NULL input

use super::schema::{self, COUNT_TABLE, DIMENSION_TABLE, METRIC_TABLE, SYMBOL_TABLE};
use super::types::{DimensionWindow, StoreStats, SymbolEntry};
use super::{DimensionValueStorage, SymbolTable};
use crate::codec::{bucket_prefix, AmountPosition, MetricData};
use crate::config::StoreConfig;
use crate::count::query::{optional_uuid_value, uuid_value, CountSql};
use crate::count::{DimensionSet, IndexTable};
use crate::error::{MetricError, Result};
use crate::series::{CountSeries, ReadFrom, SeriesKey, SeriesStorage};
use crate::types::EntityRef;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::fs;
use uuid::Uuid;

/// SQLite-backed storage for every table the engine uses.
pub struct SqliteStore {
    config: StoreConfig,
    primary: Mutex<Connection>,
    replica: Option<Mutex<Connection>>,
    /// name → id for symbols already interned
    symbols: RwLock<HashMap<String, i32>>,
    /// (table, column) pairs of summary tables known to exist
    summary_tables: Mutex<HashSet<(String, String)>>,
}

impl SqliteStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let primary = match &config.database_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(path)?;
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        prepare_connection(&primary, &config)?;
        schema::initialize(&primary)?;

        let replica = match (&config.database_path, config.read_only_connection) {
            (Some(path), true) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                prepare_connection(&conn, &config)?;
                Some(Mutex::new(conn))
            }
            _ => None,
        };

        info!(
            "opened metric store at {} (read-only connection: {})",
            config
                .database_path
                .as_ref()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string()),
            replica.is_some()
        );

        Ok(Self {
            config,
            primary: Mutex::new(primary),
            replica,
            symbols: RwLock::new(HashMap::new()),
            summary_tables: Mutex::new(HashSet::new()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.primary.lock()
    }

    fn reader(&self, from: ReadFrom) -> MutexGuard<'_, Connection> {
        match (from, &self.replica) {
            (ReadFrom::Replica, Some(replica)) => replica.lock(),
            _ => self.primary.lock(),
        }
    }

    // ========================================================================
    // Metric queries spanning several series
    // ========================================================================

    /// Every dimension id that has rows for this metric.
    pub fn metric_dimension_ids(&self, entity: &EntityRef, symbol_id: i32) -> Result<Vec<Uuid>> {
        let conn = self.reader(ReadFrom::Primary);
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT dimensionId FROM Metric WHERE id = ? AND typeId = ? AND symbolId = ? ORDER BY dimensionId",
        )?;
        let ids = stmt
            .query_map(
                params_from_iter(metric_params(entity, symbol_id)),
                |row| row.get::<_, Uuid>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Remove every dimension of a metric for one entity.
    pub fn delete_metric(&self, entity: &EntityRef, symbol_id: i32) -> Result<usize> {
        let conn = self.writer();
        execute(
            &conn,
            "DELETE FROM Metric WHERE id = ? AND typeId = ? AND symbolId = ?",
            &metric_params(entity, symbol_id),
        )
    }

    /// Window bounds of every non-total dimension, joined with the
    /// dimension's value text and ordered by it.
    pub fn dimension_windows(
        &self,
        entity: &EntityRef,
        symbol_id: i32,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<DimensionWindow>> {
        let mut sql = String::from(
            "SELECT m.dimensionId, d.value, MAX(m.data), MIN(m.data) FROM Metric m \
             JOIN MetricDimension d ON d.dimensionId = m.dimensionId \
             WHERE m.id = ? AND m.typeId = ? AND m.symbolId = ?",
        );
        let mut params = metric_params(entity, symbol_id);
        push_range(&mut sql, &mut params, "m.data", start, end)?;
        sql.push_str(" GROUP BY m.dimensionId, d.value ORDER BY d.value");

        let conn = self.reader(ReadFrom::Replica);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(&params), |row| {
                Ok((
                    row.get::<_, Uuid>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(dimension_id, value, max, min)| {
                Ok(DimensionWindow {
                    dimension_id,
                    value,
                    max: MetricData::from_slice(&max)?,
                    min: MetricData::from_slice(&min)?,
                })
            })
            .collect()
    }

    /// `(latest, earliest)` rows of several metrics of one entity and
    /// dimension over the same window, in a single query. Metrics without
    /// rows in the window are absent from the result.
    pub fn window_bounds_by_symbol(
        &self,
        entity: &EntityRef,
        dimension_id: &Uuid,
        symbol_ids: &[i32],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<HashMap<i32, (MetricData, MetricData)>> {
        if symbol_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; symbol_ids.len()].join(", ");
        let mut sql = format!(
            "SELECT symbolId, MAX(data), MIN(data) FROM Metric \
             WHERE id = ? AND typeId = ? AND dimensionId = ? AND symbolId IN ({placeholders})"
        );
        let mut params = vec![
            uuid_value(&entity.id),
            uuid_value(&entity.type_id),
            uuid_value(dimension_id),
        ];
        params.extend(symbol_ids.iter().map(|id| Value::Integer(*id as i64)));
        push_range(&mut sql, &mut params, "data", start, end)?;
        sql.push_str(" GROUP BY symbolId");

        let conn = self.reader(ReadFrom::Replica);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(&params), |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut bounds = HashMap::with_capacity(rows.len());
        for (symbol_id, max, min) in rows {
            bounds.insert(
                symbol_id,
                (MetricData::from_slice(&max)?, MetricData::from_slice(&min)?),
            );
        }
        Ok(bounds)
    }

    /// Rows of one series inside a window, in bucket order.
    pub fn rows_between(
        &self,
        key: &SeriesKey,
        after: Option<i64>,
        at_or_before: Option<i64>,
    ) -> Result<Vec<MetricData>> {
        let (filter, mut params) = series_filter(key);
        let mut sql = format!("SELECT data FROM {} WHERE {}", series_table(key), filter);
        push_range(&mut sql, &mut params, "data", after, at_or_before)?;
        sql.push_str(" ORDER BY data");

        let conn = self.reader(ReadFrom::Replica);
        query_rows(&conn, &sql, &params)
    }

    // ========================================================================
    // Count records
    // ========================================================================

    pub fn find_count_id(&self, query: &CountSql) -> Result<Option<Uuid>> {
        let conn = self.reader(ReadFrom::Primary);
        let mut stmt = conn.prepare(&query.sql)?;
        let id = stmt
            .query_row(params_from_iter(&query.params), |row| row.get::<_, Uuid>(0))
            .optional()?;
        Ok(id)
    }

    /// Run a summing query; `None` when nothing matched.
    pub fn sum_counts(&self, query: &CountSql) -> Result<Option<i64>> {
        let conn = self.reader(ReadFrom::Replica);
        let mut stmt = conn.prepare(&query.sql)?;
        let sum = stmt.query_row(params_from_iter(&query.params), |row| row.get::<_, Option<i64>>(0))?;
        Ok(sum)
    }

    /// Insert the first counter row of a count and all of its dimension
    /// rows in one transaction.
    pub fn insert_count(
        &self,
        series: &CountSeries,
        data: &MetricData,
        dimensions: &DimensionSet,
        field_symbols: &HashMap<String, i32>,
    ) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        insert_series_row(&tx, &SeriesKey::Count(series.clone()), data)?;

        for dimension in dimensions.iter() {
            let key = dimension.key();
            let symbol_id = field_symbols
                .get(&key)
                .ok_or_else(|| MetricError::Config(format!("no symbol resolved for dimension {}", key)))?;
            let sql = format!(
                "INSERT INTO {} (countId, id, dimensionsSymbolId, symbolId, value) VALUES (?, ?, ?, ?, ?)",
                dimension.index_table().table_name()
            );
            for value in dimension.values() {
                execute(
                    &tx,
                    &sql,
                    &[
                        uuid_value(&series.count_id),
                        optional_uuid_value(series.record_id.as_ref()),
                        Value::Integer(series.dimensions_symbol_id as i64),
                        Value::Integer(*symbol_id as i64),
                        value.to_sql_value(),
                    ],
                )?;
            }
        }

        tx.commit()?;
        debug!("inserted count {} with {} dimensions", series.count_id, dimensions.len());
        Ok(())
    }

    /// Delete every count of an action for a record scope. Dimension rows
    /// go first so no dimension row outlives its counter rows. Returns the
    /// number of counter rows removed.
    pub fn delete_counts(
        &self,
        record_id: Option<&Uuid>,
        action_symbol_id: i32,
        tables: &[IndexTable],
    ) -> Result<usize> {
        let record = optional_uuid_value(record_id);
        let action = Value::Integer(action_symbol_id as i64);

        let mut conn = self.writer();
        let tx = conn.transaction()?;
        for table in tables {
            let sql = format!(
                "DELETE FROM {} WHERE id IS ? AND countId IN \
                 (SELECT DISTINCT countId FROM {COUNT_TABLE} WHERE id IS ? AND actionSymbolId = ?)",
                table.table_name()
            );
            execute(&tx, &sql, &[record.clone(), record.clone(), action.clone()])?;
        }
        let removed = execute(
            &tx,
            "DELETE FROM CountRecord WHERE id IS ? AND actionSymbolId = ?",
            &[record, action],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    // ========================================================================
    // Count summaries
    // ========================================================================

    fn ensure_summary_table(&self, conn: &Connection, table: &str, column: &str) -> Result<()> {
        let key = (table.to_string(), column.to_string());
        let mut known = self.summary_tables.lock();
        if known.contains(&key) {
            return Ok(());
        }
        conn.execute_batch(&schema::summary_table_ddl(table, column)?)?;
        known.insert(key);
        Ok(())
    }

    /// Add `amount` to a summary value, creating it when missing.
    pub fn add_summary(&self, table: &str, column: &str, id: &Uuid, symbol_id: i32, amount: f64) -> Result<()> {
        self.write_summary(table, column, id, symbol_id, amount, true)
    }

    /// Overwrite a summary value, creating it when missing.
    pub fn set_summary(&self, table: &str, column: &str, id: &Uuid, symbol_id: i32, amount: f64) -> Result<()> {
        self.write_summary(table, column, id, symbol_id, amount, false)
    }

    fn write_summary(
        &self,
        table: &str,
        column: &str,
        id: &Uuid,
        symbol_id: i32,
        amount: f64,
        increment: bool,
    ) -> Result<()> {
        let conn = self.writer();
        self.ensure_summary_table(&conn, table, column)?;

        let update = if increment {
            format!("UPDATE {table} SET {column} = {column} + ? WHERE id = ? AND symbolId = ?")
        } else {
            format!("UPDATE {table} SET {column} = ? WHERE id = ? AND symbolId = ?")
        };
        let update_params = [
            Value::Real(amount),
            uuid_value(id),
            Value::Integer(symbol_id as i64),
        ];
        if execute(&conn, &update, &update_params)? > 0 {
            return Ok(());
        }

        let insert = format!("INSERT INTO {table} (id, symbolId, {column}) VALUES (?, ?, ?)");
        match execute(
            &conn,
            &insert,
            &[uuid_value(id), Value::Integer(symbol_id as i64), Value::Real(amount)],
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.is_duplicate_key() => {
                if execute(&conn, &update, &update_params)? == 1 {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn summary_value(&self, table: &str, column: &str, id: &Uuid, symbol_id: i32) -> Result<Option<f64>> {
        let conn = self.writer();
        self.ensure_summary_table(&conn, table, column)?;
        let value = conn
            .query_row(
                &format!("SELECT {column} FROM {table} WHERE id = ? AND symbolId = ?"),
                params_from_iter([uuid_value(id), Value::Integer(symbol_id as i64)]),
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_summary(&self, table: &str, column: &str, id: &Uuid, symbol_id: i32) -> Result<usize> {
        let conn = self.writer();
        self.ensure_summary_table(&conn, table, column)?;
        execute(
            &conn,
            &format!("DELETE FROM {table} WHERE id = ? AND symbolId = ?"),
            &[uuid_value(id), Value::Integer(symbol_id as i64)],
        )
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn symbols(&self) -> Result<Vec<SymbolEntry>> {
        let conn = self.reader(ReadFrom::Replica);
        let mut stmt = conn.prepare_cached("SELECT symbolId, value FROM Symbol ORDER BY symbolId")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(SymbolEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.reader(ReadFrom::Replica);
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            metric_rows: count(METRIC_TABLE)?,
            dimensions: count(DIMENSION_TABLE)?,
            count_rows: count(COUNT_TABLE)?,
            symbols: count(SYMBOL_TABLE)?,
        })
    }
}

// ============================================================================
// Series primitives
// ============================================================================

impl SeriesStorage for SqliteStore {
    fn latest(&self, key: &SeriesKey, at_or_before: Option<i64>, from: ReadFrom) -> Result<Option<MetricData>> {
        let (filter, mut params) = series_filter(key);
        let mut sql = format!("SELECT MAX(data) FROM {} WHERE {}", series_table(key), filter);
        push_range(&mut sql, &mut params, "data", None, at_or_before)?;

        let conn = self.reader(from);
        let mut stmt = conn.prepare_cached(&sql)?;
        let raw = stmt.query_row(params_from_iter(&params), |row| row.get::<_, Option<Vec<u8>>>(0))?;
        raw.map(|bytes| MetricData::from_slice(&bytes).map_err(MetricError::from))
            .transpose()
    }

    fn window(
        &self,
        key: &SeriesKey,
        after: i64,
        at_or_before: Option<i64>,
        from: ReadFrom,
    ) -> Result<Option<(MetricData, MetricData)>> {
        let (filter, mut params) = series_filter(key);
        let mut sql = format!(
            "SELECT MAX(data), MIN(data) FROM {} WHERE {}",
            series_table(key),
            filter
        );
        push_range(&mut sql, &mut params, "data", Some(after), at_or_before)?;

        let conn = self.reader(from);
        let mut stmt = conn.prepare_cached(&sql)?;
        let (max, min) = stmt.query_row(params_from_iter(&params), |row| {
            Ok((
                row.get::<_, Option<Vec<u8>>>(0)?,
                row.get::<_, Option<Vec<u8>>>(1)?,
            ))
        })?;
        match (max, min) {
            (Some(max), Some(min)) => Ok(Some((
                MetricData::from_slice(&max)?,
                MetricData::from_slice(&min)?,
            ))),
            _ => Ok(None),
        }
    }

    fn rows(&self, key: &SeriesKey) -> Result<Vec<MetricData>> {
        let (filter, params) = series_filter(key);
        let sql = format!("SELECT data FROM {} WHERE {} ORDER BY data", series_table(key), filter);
        let conn = self.writer();
        query_rows(&conn, &sql, &params)
    }

    fn insert(&self, key: &SeriesKey, data: &MetricData) -> Result<()> {
        let conn = self.writer();
        insert_series_row(&conn, key, data)
    }

    fn add_at(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize> {
        let (filter, filter_params) = series_filter(key);
        let (stamp, stamp_params) = series_stamp(key);
        let sql = format!(
            "UPDATE {} SET data = metric_add(data, ?, ?){} WHERE {} AND substr(data, 1, 4) = ?",
            series_table(key),
            stamp,
            filter
        );
        let mut params = vec![Value::Integer(amount), Value::Integer(amount)];
        params.extend(stamp_params);
        params.extend(filter_params);
        params.push(Value::Blob(bucket_prefix(bucket)?.to_vec()));

        let conn = self.writer();
        execute(&conn, &sql, &params)
    }

    fn add_from(&self, key: &SeriesKey, bucket: i64, amount: i64) -> Result<usize> {
        let (filter, filter_params) = series_filter(key);
        let (stamp, stamp_params) = series_stamp(key);
        let sql = format!(
            "UPDATE {} SET data = metric_add(data, ?, CASE WHEN substr(data, 1, 4) = ? THEN ? ELSE 0 END){} \
             WHERE {} AND data >= ?",
            series_table(key),
            stamp,
            filter
        );
        let mut params = vec![
            Value::Integer(amount),
            Value::Blob(bucket_prefix(bucket)?.to_vec()),
            Value::Integer(amount),
        ];
        params.extend(stamp_params);
        params.extend(filter_params);
        params.push(Value::Blob(MetricData::lower_bound(bucket)?.to_vec()));

        let conn = self.writer();
        execute(&conn, &sql, &params)
    }

    fn replace(&self, key: &SeriesKey, data: &MetricData) -> Result<usize> {
        let (filter, filter_params) = series_filter(key);
        let (stamp, stamp_params) = series_stamp(key);
        let sql = format!(
            "UPDATE {} SET data = ?{} WHERE {} AND substr(data, 1, 4) = ?",
            series_table(key),
            stamp,
            filter
        );
        let mut params = vec![Value::Blob(data.as_bytes().to_vec())];
        params.extend(stamp_params);
        params.extend(filter_params);
        params.push(Value::Blob(data.as_bytes()[..4].to_vec()));

        let conn = self.writer();
        execute(&conn, &sql, &params)
    }

    fn delete(&self, key: &SeriesKey) -> Result<usize> {
        let (filter, params) = series_filter(key);
        let sql = format!("DELETE FROM {} WHERE {}", series_table(key), filter);
        let conn = self.writer();
        execute(&conn, &sql, &params)
    }
}

impl SymbolTable for SqliteStore {
    fn symbol_id(&self, name: &str) -> Result<i32> {
        if let Some(id) = self.symbols.read().get(name) {
            return Ok(*id);
        }

        let id = {
            let conn = self.writer();
            let mut insert = conn.prepare_cached("INSERT OR IGNORE INTO Symbol (value) VALUES (?)")?;
            insert.execute([name])?;
            let mut select = conn.prepare_cached("SELECT symbolId FROM Symbol WHERE value = ?")?;
            let id = select.query_row([name], |row| row.get::<_, i32>(0))?;
            id
        };
        self.symbols.write().insert(name.to_string(), id);
        Ok(id)
    }
}

impl DimensionValueStorage for SqliteStore {
    fn find_dimension_id(&self, value: &str) -> Result<Option<Uuid>> {
        let conn = self.writer();
        let id = conn
            .prepare_cached("SELECT dimensionId FROM MetricDimension WHERE value = ?")?
            .query_row([value], |row| row.get::<_, Uuid>(0))
            .optional()?;
        Ok(id)
    }

    fn insert_dimension(&self, id: Uuid, value: &str) -> Result<()> {
        let conn = self.writer();
        execute(
            &conn,
            "INSERT INTO MetricDimension (dimensionId, value) VALUES (?, ?)",
            &[uuid_value(&id), Value::Text(value.to_string())],
        )?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn prepare_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.busy_timeout(config.query_timeout())?;
    register_functions(conn)?;
    Ok(())
}

fn function_flags() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function("metric_add", 3, function_flags(), |ctx| {
        let raw: Vec<u8> = ctx.get(0)?;
        let cumulative: i64 = ctx.get(1)?;
        let delta: i64 = ctx.get(2)?;
        let data = MetricData::from_slice(&raw)
            .and_then(|data| data.with_added(cumulative, delta))
            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
        Ok(data.as_bytes().to_vec())
    })?;

    conn.create_scalar_function("metric_amount", 2, function_flags(), |ctx| {
        let raw: Option<Vec<u8>> = ctx.get(0)?;
        let position = match ctx.get::<i64>(1)? {
            1 => AmountPosition::Cumulative,
            2 => AmountPosition::Delta,
            other => {
                return Err(rusqlite::Error::UserFunctionError(
                    format!("metric_amount position must be 1 or 2, got {}", other).into(),
                ))
            }
        };
        raw.map(|bytes| {
            MetricData::from_slice(&bytes)
                .map(|data| data.micros(position))
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        })
        .transpose()
    })?;

    Ok(())
}

fn execute(conn: &Connection, sql: &str, params: &[Value]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.execute(params_from_iter(params))?)
}

fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<MetricData>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let raw = stmt
        .query_map(params_from_iter(params), |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.iter()
        .map(|bytes| MetricData::from_slice(bytes).map_err(MetricError::from))
        .collect()
}

fn insert_series_row(conn: &Connection, key: &SeriesKey, data: &MetricData) -> Result<()> {
    let blob = Value::Blob(data.as_bytes().to_vec());
    match key {
        SeriesKey::Metric {
            id,
            type_id,
            symbol_id,
            dimension_id,
        } => execute(
            conn,
            "INSERT INTO Metric (id, typeId, symbolId, dimensionId, data) VALUES (?, ?, ?, ?, ?)",
            &[
                uuid_value(id),
                uuid_value(type_id),
                Value::Integer(*symbol_id as i64),
                uuid_value(dimension_id),
                blob,
            ],
        )?,
        SeriesKey::Count(count) => execute(
            conn,
            "INSERT INTO CountRecord (countId, id, typeId, actionSymbolId, dimensionsSymbolId, createDate, updateDate, data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                uuid_value(&count.count_id),
                optional_uuid_value(count.record_id.as_ref()),
                uuid_value(&count.type_id),
                Value::Integer(count.action_symbol_id as i64),
                Value::Integer(count.dimensions_symbol_id as i64),
                Value::Integer(count.update_date),
                Value::Integer(count.update_date),
                blob,
            ],
        )?,
    };
    Ok(())
}

fn series_table(key: &SeriesKey) -> &'static str {
    match key {
        SeriesKey::Metric { .. } => METRIC_TABLE,
        SeriesKey::Count(_) => COUNT_TABLE,
    }
}

fn series_filter(key: &SeriesKey) -> (&'static str, Vec<Value>) {
    match key {
        SeriesKey::Metric {
            id,
            type_id,
            symbol_id,
            dimension_id,
        } => (
            "id = ? AND typeId = ? AND symbolId = ? AND dimensionId = ?",
            vec![
                uuid_value(id),
                uuid_value(type_id),
                Value::Integer(*symbol_id as i64),
                uuid_value(dimension_id),
            ],
        ),
        SeriesKey::Count(count) => (
            "countId = ? AND actionSymbolId = ?",
            vec![
                uuid_value(&count.count_id),
                Value::Integer(count.action_symbol_id as i64),
            ],
        ),
    }
}

/// Extra assignment applied by every update of a series.
fn series_stamp(key: &SeriesKey) -> (&'static str, Vec<Value>) {
    match key {
        SeriesKey::Metric { .. } => ("", Vec::new()),
        SeriesKey::Count(count) => (", updateDate = ?", vec![Value::Integer(count.update_date)]),
    }
}

fn metric_params(entity: &EntityRef, symbol_id: i32) -> Vec<Value> {
    vec![
        uuid_value(&entity.id),
        uuid_value(&entity.type_id),
        Value::Integer(symbol_id as i64),
    ]
}

/// Append `column > upper(after)` and `column <= upper(at_or_before)`.
fn push_range(
    sql: &mut String,
    params: &mut Vec<Value>,
    column: &str,
    after: Option<i64>,
    at_or_before: Option<i64>,
) -> Result<()> {
    if let Some(after) = after {
        sql.push_str(&format!(" AND {column} > ?"));
        params.push(Value::Blob(MetricData::upper_bound(after)?.to_vec()));
    }
    if let Some(end) = at_or_before {
        sql.push_str(&format!(" AND {column} <= ?"));
        params.push(Value::Blob(MetricData::upper_bound(end)?.to_vec()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_ID;

    const T0: i64 = 1_710_028_800_000;
    const HOUR: i64 = 3_600_000;

    fn key() -> SeriesKey {
        SeriesKey::Metric {
            id: Uuid::from_u128(1),
            type_id: Uuid::from_u128(2),
            symbol_id: 3,
            dimension_id: ZERO_ID,
        }
    }

    fn data(t: i64, cumulative: i64, delta: i64) -> MetricData {
        MetricData::from_micros(t, cumulative, delta).unwrap()
    }

    #[test]
    fn test_insert_rejects_second_row_in_bucket() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        store.insert(&key(), &data(T0, 5, 5))?;
        let err = store.insert(&key(), &data(T0 + 30_000, 9, 9)).unwrap_err();
        assert!(err.is_duplicate_key());
        Ok(())
    }

    #[test]
    fn test_add_at_and_add_from() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        store.insert(&key(), &data(T0, 1, 1))?;
        store.insert(&key(), &data(T0 + HOUR, 3, 2))?;
        store.insert(&key(), &data(T0 + 2 * HOUR, 6, 3))?;

        assert_eq!(store.add_at(&key(), T0, 10)?, 1);
        assert_eq!(store.add_at(&key(), T0 + 5 * HOUR, 10)?, 0);
        assert_eq!(store.add_from(&key(), T0 + HOUR, 100)?, 2);

        let rows = store.rows(&key())?;
        assert_eq!(rows, vec![
            data(T0, 11, 11),
            data(T0 + HOUR, 103, 102),
            data(T0 + 2 * HOUR, 106, 3),
        ]);
        Ok(())
    }

    #[test]
    fn test_latest_and_window_bounds() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        for (i, t) in [T0, T0 + HOUR, T0 + 2 * HOUR].into_iter().enumerate() {
            let n = i as i64 + 1;
            store.insert(&key(), &data(t, n * (n + 1) / 2, n))?;
        }

        let latest = store.latest(&key(), Some(T0 + HOUR + 1), ReadFrom::Primary)?;
        assert_eq!(latest, Some(data(T0 + HOUR, 3, 2)));
        assert_eq!(store.latest(&key(), Some(T0 - 1), ReadFrom::Primary)?, None);

        let (max, min) = store.window(&key(), T0, None, ReadFrom::Replica)?.unwrap();
        assert_eq!(min.event_millis(), T0 + HOUR);
        assert_eq!(max.event_millis(), T0 + 2 * HOUR);
        assert!(store.window(&key(), T0 + 2 * HOUR, None, ReadFrom::Replica)?.is_none());
        Ok(())
    }

    #[test]
    fn test_metric_amount_function() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        store.insert(&key(), &data(T0, 42, -7))?;
        let conn = store.writer();
        let (cumulative, delta, missing): (i64, i64, Option<i64>) = conn.query_row(
            "SELECT metric_amount(data, 1), metric_amount(data, 2), metric_amount(NULL, 1) FROM Metric",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!((cumulative, delta, missing), (42, -7, None));
        assert!(conn
            .query_row("SELECT metric_amount(data, 3) FROM Metric", [], |row| row.get::<_, i64>(0))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_symbols_are_interned_once() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let a = store.symbol_id("views")?;
        let b = store.symbol_id("likes")?;
        assert_ne!(a, b);
        assert_eq!(store.symbol_id("views")?, a);
        assert_eq!(store.symbols()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_dimension_values_are_unique() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let id = Uuid::from_u128(77);
        store.insert_dimension(id, "US")?;
        assert_eq!(store.find_dimension_id("US")?, Some(id));
        assert_eq!(store.find_dimension_id("CA")?, None);
        assert!(store.insert_dimension(Uuid::from_u128(78), "US").unwrap_err().is_duplicate_key());
        Ok(())
    }

    #[test]
    fn test_read_only_connection_sees_committed_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = StoreConfig {
            read_only_connection: true,
            ..StoreConfig::with_path(dir.path().join("metrics.db"))
        };
        let store = SqliteStore::open(config)?;
        store.insert(&key(), &data(T0, 4, 4))?;

        assert_eq!(store.latest(&key(), None, ReadFrom::Replica)?, Some(data(T0, 4, 4)));
        assert_eq!(store.stats()?.metric_rows, 1);
        Ok(())
    }

    #[test]
    fn test_summary_update_or_insert() -> Result<()> {
        let store = SqliteStore::in_memory()?;
        let id = Uuid::from_u128(5);
        store.add_summary("ArticleSummary", "views", &id, 9, 2.5)?;
        store.add_summary("ArticleSummary", "views", &id, 9, 1.0)?;
        assert_eq!(store.summary_value("ArticleSummary", "views", &id, 9)?, Some(3.5));

        store.set_summary("ArticleSummary", "views", &id, 9, 10.0)?;
        assert_eq!(store.summary_value("ArticleSummary", "views", &id, 9)?, Some(10.0));

        assert_eq!(store.delete_summary("ArticleSummary", "views", &id, 9)?, 1);
        assert_eq!(store.summary_value("ArticleSummary", "views", &id, 9)?, None);
        assert!(store.add_summary("Bad Table", "views", &id, 9, 1.0).is_err());
        Ok(())
    }
}
