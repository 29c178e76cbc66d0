//! # Metric Store
//!
//! Time-bucketed counters stored as fixed 20-byte rows in SQLite.
//!
//! Each row packs the bucket start (Unix minutes), the running cumulative
//! amount and the bucket's own delta. Rows of one series sort by bucket
//! when compared as raw bytes, so every windowed read is a `MIN`/`MAX` over
//! an index range.
//!
//! ## Layout
//!
//! - **codec**: the 20-byte row format
//! - **precision**: event date bucketing
//! - **series**: increment / set / read protocol for one series
//! - **metric**: [`MetricDatabase`], metrics segmented by one dimension
//! - **count**: [`CountRecord`], counters keyed by a combination of
//!   dimension values
//! - **dimension**: dimension value → id resolution
//! - **cache**: per-entity read cache
//! - **storage**: SQLite backend and the traits the engine consumes
//!
//! ## Example
//!
//! ```no_run
//! use metric_store::{DimensionResolver, EntityRef, MetricDatabase, SqliteStore, StoreConfig};
//! use metric_store::precision::EventDatePrecision;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # fn main() -> metric_store::Result<()> {
//! let store = Arc::new(SqliteStore::open(StoreConfig::with_path("metrics.db"))?);
//! let dimensions = Arc::new(DimensionResolver::new(store.clone(), 1000));
//! let article_type = Uuid::now_v7();
//! let views = MetricDatabase::new(store, dimensions, article_type, "views")
//!     .with_precision(EventDatePrecision::Day);
//!
//! let article = EntityRef::new(Uuid::now_v7(), article_type);
//! views.increment(&article, Some("US"), None, 1.0)?;
//! let total = views.metric_sum(&article, None, None)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod count;
pub mod dimension;
pub mod error;
pub mod ids;
pub mod metric;
pub mod precision;
pub mod series;
pub mod storage;
pub mod types;

pub use cache::ReadCache;
pub use codec::MetricData;
pub use config::StoreConfig;
pub use count::{CountRecord, DimensionSet, FieldDescriptor, SummaryField, ValueKind};
pub use dimension::DimensionResolver;
pub use error::{MetricError, Result};
pub use metric::MetricDatabase;
pub use precision::{Calendar, EventDatePrecision};
pub use series::{Series, SeriesKey, SeriesStorage};
pub use storage::SqliteStore;
pub use types::{EntityRef, ZERO_ID};
