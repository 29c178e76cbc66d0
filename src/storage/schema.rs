//! SQLite schema for metrics, dimensions and count records.

use crate::count::IndexTable;
use crate::error::{MetricError, Result};
use rusqlite::Connection;

pub const SYMBOL_TABLE: &str = "Symbol";
pub const METRIC_TABLE: &str = "Metric";
pub const DIMENSION_TABLE: &str = "MetricDimension";
pub const COUNT_TABLE: &str = "CountRecord";

const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS Symbol (
    symbolId INTEGER PRIMARY KEY AUTOINCREMENT,
    value TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS Metric (
    id BLOB NOT NULL,
    typeId BLOB NOT NULL,
    symbolId INTEGER NOT NULL,
    dimensionId BLOB NOT NULL,
    data BLOB NOT NULL CHECK (length(data) = 20)
);
CREATE UNIQUE INDEX IF NOT EXISTS k_Metric_bucket
    ON Metric (id, symbolId, dimensionId, substr(data, 1, 4));
CREATE INDEX IF NOT EXISTS k_Metric_data
    ON Metric (id, symbolId, dimensionId, data);

CREATE TABLE IF NOT EXISTS MetricDimension (
    dimensionId BLOB NOT NULL PRIMARY KEY,
    value TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS CountRecord (
    countId BLOB NOT NULL,
    id BLOB,
    typeId BLOB NOT NULL,
    actionSymbolId INTEGER NOT NULL,
    dimensionsSymbolId INTEGER NOT NULL,
    createDate INTEGER NOT NULL,
    updateDate INTEGER NOT NULL,
    data BLOB NOT NULL CHECK (length(data) = 20)
);
CREATE UNIQUE INDEX IF NOT EXISTS k_CountRecord_bucket
    ON CountRecord (countId, actionSymbolId, substr(data, 1, 4));
CREATE INDEX IF NOT EXISTS k_CountRecord_data
    ON CountRecord (countId, actionSymbolId, data);
CREATE INDEX IF NOT EXISTS k_CountRecord_id
    ON CountRecord (id, actionSymbolId);
"#;

/// Create every table and index the store needs. Idempotent.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CORE_SCHEMA)?;
    for table in IndexTable::ALL {
        conn.execute_batch(&index_table_ddl(table))?;
    }
    log::info!("metric schema initialized");
    Ok(())
}

fn index_table_ddl(table: IndexTable) -> String {
    let name = table.table_name();
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            countId BLOB NOT NULL,
            id BLOB,
            dimensionsSymbolId INTEGER NOT NULL,
            symbolId INTEGER NOT NULL,
            value {value_type} NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS k_{name}_value
            ON {name} (countId, symbolId, value);
        CREATE INDEX IF NOT EXISTS k_{name}_lookup
            ON {name} (dimensionsSymbolId, symbolId, value);",
        value_type = table.sql_type(),
    )
}

/// DDL for a summary table with the given value column.
pub fn summary_table_ddl(table: &str, column: &str) -> Result<String> {
    validate_identifier(table)?;
    validate_identifier(column)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BLOB NOT NULL,
            symbolId INTEGER NOT NULL,
            {column} REAL NOT NULL,
            PRIMARY KEY (id, symbolId)
        )"
    ))
}

/// Accept only plain `[A-Za-z_][A-Za-z0-9_]*` names, since identifiers are
/// spliced into SQL text.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MetricError::InvalidIdentifier(name.to_string()))
    }
}
