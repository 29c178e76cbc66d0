//! Store configuration.

use crate::error::{MetricError, Result};
use crate::precision::Calendar;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default capacity of the dimension id cache.
pub const DEFAULT_DIMENSION_CACHE_CAPACITY: usize = 1000;

/// Default per-query timeout in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 3_000;

/// Configuration for a [`crate::storage::SqliteStore`] and the metric
/// facades built on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,

    /// How long a statement waits on a locked database before failing
    pub query_timeout_ms: u64,

    /// Maximum number of cached dimension value → id mappings
    pub dimension_cache_capacity: usize,

    /// Serve plain reads from a separate read-only connection
    pub read_only_connection: bool,

    /// Calendar used to truncate event dates into buckets
    pub calendar: Calendar,

    /// Refuse increments whose event date lies in the future
    pub reject_future_events: bool,

    /// Table that mirrors per-entity count summaries
    pub summary_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_path: None,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            dimension_cache_capacity: DEFAULT_DIMENSION_CACHE_CAPACITY,
            read_only_connection: false,
            calendar: Calendar::Local,
            reject_future_events: true,
            summary_table: "CountRecordSummary".to_string(),
        }
    }
}

impl StoreConfig {
    /// In-memory store, mainly for tests and tooling.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing keys fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension_cache_capacity == 0 {
            return Err(MetricError::Config(
                "dimension_cache_capacity must be greater than zero".to_string(),
            ));
        }
        if self.read_only_connection && self.database_path.is_none() {
            return Err(MetricError::Config(
                "read_only_connection requires a database_path".to_string(),
            ));
        }
        crate::storage::schema::validate_identifier(&self.summary_table)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.query_timeout(), Duration::from_secs(3));
        assert_eq!(config.dimension_cache_capacity, 1000);
        assert!(config.reject_future_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_json() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"calendar": "utc", "dimension_cache_capacity": 16, "database_path": "/tmp/m.db"}}"#
        )?;

        let config = StoreConfig::from_json_file(file.path())?;
        assert_eq!(config.calendar, Calendar::Utc);
        assert_eq!(config.dimension_cache_capacity, 16);
        assert_eq!(config.query_timeout_ms, DEFAULT_QUERY_TIMEOUT_MS);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/m.db")));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = StoreConfig {
            dimension_cache_capacity: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(MetricError::Config(_))));

        let config = StoreConfig {
            summary_table: "Summary; DROP TABLE Metric".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(MetricError::InvalidIdentifier(_))));

        let config = StoreConfig {
            read_only_connection: true,
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
