//! Persistence for metrics and count records.
//!
//! - **hot_cache**: bounded LRU map used for dimension ids
//! - **schema**: table and index definitions
//! - **sqlite**: [`SqliteStore`], the bundled backend implementing every
//!   storage trait the engine consumes
//!
//! The engine only talks to storage through [`SymbolTable`],
//! [`DimensionValueStorage`] and [`crate::series::SeriesStorage`].

pub mod hot_cache;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use hot_cache::{HotCache, HotCacheStats};
pub use sqlite::SqliteStore;
pub use types::{DimensionWindow, StoreStats, SymbolEntry};

use crate::error::Result;
use uuid::Uuid;

/// Interns symbol names as small integers.
pub trait SymbolTable {
    /// Id of `name`, creating it on first use.
    fn symbol_id(&self, name: &str) -> Result<i32>;
}

/// Durable mapping from dimension value text to dimension id.
pub trait DimensionValueStorage {
    fn find_dimension_id(&self, value: &str) -> Result<Option<Uuid>>;

    /// Record a new mapping. A value that is already mapped must surface as
    /// an error for which [`crate::MetricError::is_duplicate_key`] is true.
    fn insert_dimension(&self, id: Uuid, value: &str) -> Result<()>;
}
