//! Storage-facing value types.

use crate::codec::MetricData;
use uuid::Uuid;

/// Row counts per table, as reported by [`super::SqliteStore::stats`].
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// Rows in the metric table
    pub metric_rows: u64,
    /// Distinct dimension values
    pub dimensions: u64,
    /// Rows in the count record table
    pub count_rows: u64,
    /// Interned symbols
    pub symbols: u64,
}

/// Windowed bounds of one dimension of a metric.
#[derive(Clone, Debug)]
pub struct DimensionWindow {
    pub dimension_id: Uuid,
    /// The dimension's value text
    pub value: String,
    /// Latest row inside the window
    pub max: MetricData,
    /// Earliest row inside the window
    pub min: MetricData,
}

/// An interned symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub id: i32,
    pub name: String,
}
