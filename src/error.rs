//! # Errors
//!
//! Every fallible operation in the crate returns [`MetricError`]. Storage
//! failures that cross the series engine are annotated with the series key
//! and the operation that was attempted.

use crate::codec::CodecError;
use crate::precision::EventDatePrecision;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MetricError>;

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    /// `set` was called on a series that is bucketed by time.
    #[error("set is only supported on series without an event date precision (found {0})")]
    SetRequiresNoPrecision(EventDatePrecision),

    #[error("event date {0} may not be in the future")]
    FutureEvent(i64),

    #[error("timestamp {0} cannot be resolved in the configured calendar")]
    InvalidTimestamp(i64),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A dimension value does not belong to its field's index table.
    #[error("dimension {field} expects {expected} values, got {found}")]
    DimensionMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("dimension set is empty")]
    EmptyDimensions,

    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage failure with the series and operation that triggered it.
    #[error("{op} on {series} failed: {source}")]
    Storage {
        op: &'static str,
        series: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetricError {
    /// Attach series context to a bare database error. Other variants are
    /// returned unchanged.
    pub fn in_series(self, op: &'static str, series: impl ToString) -> Self {
        match self {
            MetricError::Database(source) => MetricError::Storage {
                op,
                series: series.to_string(),
                source,
            },
            other => other,
        }
    }

    /// True for errors raised by a violated unique or primary key.
    pub fn is_duplicate_key(&self) -> bool {
        let source = match self {
            MetricError::Database(e) | MetricError::Storage { source: e, .. } => e,
            _ => return false,
        };
        matches!(
            source,
            rusqlite::Error::SqliteFailure(e, _)
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }

    /// True when the database gave up waiting on a lock within the
    /// configured query timeout.
    pub fn is_timeout(&self) -> bool {
        let source = match self {
            MetricError::Database(e) | MetricError::Storage { source: e, .. } => e,
            _ => return false,
        };
        matches!(
            source,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: i32) -> MetricError {
        MetricError::Database(rusqlite::Error::SqliteFailure(ffi::Error::new(code), None))
    }

    #[test]
    fn test_classifies_sqlite_failures() {
        let busy = sqlite_failure(ffi::SQLITE_BUSY);
        assert!(busy.is_timeout());
        assert!(!busy.is_duplicate_key());

        let unique = sqlite_failure(ffi::SQLITE_CONSTRAINT_UNIQUE);
        assert!(unique.is_duplicate_key());
        assert!(!unique.is_timeout());

        assert!(!MetricError::EmptyDimensions.is_timeout());
        assert!(!MetricError::EmptyDimensions.is_duplicate_key());
    }

    #[test]
    fn test_in_series_keeps_classification() {
        let err = sqlite_failure(ffi::SQLITE_CONSTRAINT_PRIMARYKEY).in_series("increment", "metric(id=1)");
        assert!(matches!(err, MetricError::Storage { op: "increment", .. }));
        assert!(err.is_duplicate_key());
        assert!(err.to_string().starts_with("increment on metric(id=1) failed"));

        let untouched = MetricError::FutureEvent(5).in_series("increment", "metric(id=1)");
        assert!(matches!(untouched, MetricError::FutureEvent(5)));
    }
}
