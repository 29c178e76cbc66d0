//! SQL for resolving and summing count records by their dimension values.
//!
//! A combination of dimension values is found by joining one alias per
//! index table on `countId` and keeping the counts for which every value
//! filter matched. Within a table the per-field filters are OR-ed, so a
//! count that matches all of them contributes exactly one joined row per
//! (field, value) pair; across tables the joined rows multiply. Comparing
//! `COUNT(*)` against that product selects the counts carrying every
//! requested value.

use super::dimension::{DimensionSet, IndexTable};
use crate::codec::MetricData;
use crate::error::{MetricError, Result};
use crate::storage::schema::COUNT_TABLE;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::fmt::Write;
use uuid::Uuid;

/// Rendered statement with its positional parameters in order.
#[derive(Debug, Clone)]
pub struct CountSql {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Everything needed to look up the counts of one dimension combination.
pub struct CountQuery<'a> {
    pub dimensions: &'a DimensionSet,
    pub dimensions_symbol_id: i32,
    pub action_symbol_id: i32,
    /// Restricts matches to rows scoped to this entity; `None` matches
    /// unscoped rows only.
    pub record_id: Option<Uuid>,
    /// Interned symbol of each dimension key
    pub field_symbols: &'a HashMap<String, i32>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

pub(crate) fn uuid_value(id: &Uuid) -> Value {
    Value::Blob(id.as_bytes().to_vec())
}

pub(crate) fn optional_uuid_value(id: Option<&Uuid>) -> Value {
    id.map_or(Value::Null, uuid_value)
}

impl<'a> CountQuery<'a> {
    /// Select the `countId` of every count carrying all requested values.
    ///
    /// A precise match also requires the count's own fields to equal the
    /// requested ones and every index table to hold no values beyond the
    /// requested ones, so counts with extra dimensions or extra values are
    /// excluded.
    pub fn count_id_sql(&self, precise: bool) -> Result<CountSql> {
        if self.dimensions.is_empty() {
            return Err(MetricError::EmptyDimensions);
        }

        let mut from = String::new();
        let mut from_params = Vec::new();
        let mut filter = String::new();
        let mut filter_params = Vec::new();
        let mut expected_rows: u64 = 1;

        for (i, table) in self.dimensions.index_tables().into_iter().enumerate() {
            let alias = format!("cr{}", i);
            let name = table.table_name();
            if i == 0 {
                write!(from, "{name} {alias}").ok();
                if precise {
                    write!(filter, "{alias}.dimensionsSymbolId = ?").ok();
                    filter_params.push(Value::Integer(self.dimensions_symbol_id as i64));
                } else {
                    filter.push_str("1 = 1");
                }
                write!(filter, " AND {alias}.id IS ?").ok();
                filter_params.push(optional_uuid_value(self.record_id.as_ref()));
                write!(
                    filter,
                    " AND EXISTS (SELECT 1 FROM {COUNT_TABLE} c WHERE c.countId = {alias}.countId AND c.actionSymbolId = ?)"
                )
                .ok();
                filter_params.push(Value::Integer(self.action_symbol_id as i64));
            } else {
                write!(
                    from,
                    " JOIN {name} {alias} ON (cr0.dimensionsSymbolId = {alias}.dimensionsSymbolId \
                     AND cr0.countId = {alias}.countId AND {alias}.id IS ?)"
                )
                .ok();
                from_params.push(optional_uuid_value(self.record_id.as_ref()));
            }

            let (clause, params, filters) = self.table_filter(table, &alias)?;
            write!(filter, " AND ({clause})").ok();
            filter_params.extend(params);
            if precise {
                write!(
                    filter,
                    " AND (SELECT COUNT(*) FROM {name} x WHERE x.countId = {alias}.countId) = {filters}"
                )
                .ok();
            }
            expected_rows = expected_rows.saturating_mul(filters);
        }

        let sql = format!(
            "SELECT cr0.countId FROM {from} WHERE {filter} GROUP BY cr0.countId HAVING COUNT(*) = {expected_rows}"
        );
        from_params.extend(filter_params);
        Ok(CountSql {
            sql,
            params: from_params,
        })
    }

    /// OR of `(symbolId = ? AND value IN (...))` over the dimensions stored
    /// in `table`, with the number of value filters it contains.
    fn table_filter(&self, table: IndexTable, alias: &str) -> Result<(String, Vec<Value>, u64)> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut filters = 0u64;

        for dimension in self.dimensions.in_table(table) {
            let key = dimension.key();
            let symbol_id = self
                .field_symbols
                .get(&key)
                .ok_or_else(|| MetricError::Config(format!("no symbol resolved for dimension {}", key)))?;
            let placeholders = vec!["?"; dimension.values().len()].join(", ");
            clauses.push(format!(
                "({alias}.symbolId = ? AND {alias}.value IN ({placeholders}))"
            ));
            params.push(Value::Integer(*symbol_id as i64));
            params.extend(dimension.values().iter().map(|v| v.to_sql_value()));
            filters += dimension.values().len() as u64;
        }

        Ok((clauses.join(" OR "), params, filters))
    }

    /// Sum the counts of every matching `countId` (imprecise match) over
    /// the query's date range.
    ///
    /// Without a start the latest cumulative at or before the end is used
    /// per count; with one, the deltas of the buckets after start.
    pub fn count_sum_sql(&self) -> Result<CountSql> {
        let ids = self.count_id_sql(false)?;

        let amount = if self.start.is_some() {
            "metric_amount(MAX(c.data), 1) - metric_amount(MIN(c.data), 1) + metric_amount(MIN(c.data), 2)"
        } else {
            "metric_amount(MAX(c.data), 1)"
        };

        let mut sql = format!(
            "SELECT SUM(amount) FROM (SELECT {amount} AS amount FROM {COUNT_TABLE} c \
             WHERE c.actionSymbolId = ? AND c.countId IN ({})",
            ids.sql
        );
        let mut params = vec![Value::Integer(self.action_symbol_id as i64)];
        params.extend(ids.params);

        if let Some(start) = self.start {
            sql.push_str(" AND c.data > ?");
            params.push(Value::Blob(MetricData::upper_bound(start)?.to_vec()));
        }
        if let Some(end) = self.end {
            sql.push_str(" AND c.data <= ?");
            params.push(Value::Blob(MetricData::upper_bound(end)?.to_vec()));
        }
        sql.push_str(" GROUP BY c.countId)");

        Ok(CountSql { sql, params })
    }
}
