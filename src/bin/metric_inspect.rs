//! # Metric Inspect CLI
//!
//! Command-line tool for looking at and repairing stored metrics.
//!
//! Usage:
//!   metric-inspect --db metrics.db rows <entity> <type> <metric> [--dimension D]
//!   metric-inspect --db metrics.db read <entity> <type> <metric> [--start MS] [--end MS]
//!   metric-inspect --db metrics.db timeline <entity> <type> <metric> --interval DAY
//!   metric-inspect --db metrics.db reconstruct <entity> <type> <metric>
//!   metric-inspect --db metrics.db symbols
//!   metric-inspect --db metrics.db stats

use clap::{Parser, Subcommand};
use metric_store::precision::EventDatePrecision;
use metric_store::{DimensionResolver, EntityRef, MetricDatabase, SqliteStore, StoreConfig};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "metric-inspect")]
#[command(about = "Inspect and repair stored metrics", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// JSON store configuration; `--db` overrides its database path
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct MetricArgs {
    /// Entity id
    entity: Uuid,

    /// Entity type id
    type_id: Uuid,

    /// Metric name
    metric: String,

    /// Dimension value; the metric total when omitted
    #[arg(short, long)]
    dimension: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the raw rows of a series
    Rows {
        #[command(flatten)]
        metric: MetricArgs,

        /// Only buckets after this time (Unix ms)
        #[arg(long)]
        after: Option<i64>,

        /// Only buckets at or before this time (Unix ms)
        #[arg(long)]
        before: Option<i64>,

        /// Output format: json, pretty
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },

    /// Read a metric value
    Read {
        #[command(flatten)]
        metric: MetricArgs,

        /// Window start, exclusive (Unix ms)
        #[arg(long)]
        start: Option<i64>,

        /// Window end, inclusive (Unix ms)
        #[arg(long)]
        end: Option<i64>,
    },

    /// Sum a metric per interval
    Timeline {
        #[command(flatten)]
        metric: MetricArgs,

        /// Grouping interval: HOUR, DAY, WEEK, MONTH, YEAR
        #[arg(short, long, default_value = "DAY")]
        interval: EventDatePrecision,

        #[arg(long)]
        start: Option<i64>,

        #[arg(long)]
        end: Option<i64>,
    },

    /// Recompute cumulative amounts of every dimension of a metric
    Reconstruct {
        #[command(flatten)]
        metric: MetricArgs,
    },

    /// List interned symbols
    Symbols,

    /// Show row counts
    Stats,
}

struct Context {
    store: Arc<SqliteStore>,
    dimensions: Arc<DimensionResolver<SqliteStore>>,
}

impl Context {
    fn open(cli: &Cli) -> Result<Self, String> {
        let mut config = match &cli.config {
            Some(path) => StoreConfig::from_json_file(path).map_err(|e| e.to_string())?,
            None => StoreConfig::default(),
        };
        if cli.db.is_some() {
            config.database_path = cli.db.clone();
        }
        if config.database_path.is_none() {
            return Err("no database given; pass --db or --config".to_string());
        }
        let capacity = config.dimension_cache_capacity;
        let store = Arc::new(SqliteStore::open(config).map_err(|e| e.to_string())?);
        let dimensions = Arc::new(DimensionResolver::new(store.clone(), capacity));
        Ok(Self { store, dimensions })
    }

    fn metric(&self, args: &MetricArgs) -> (MetricDatabase, EntityRef) {
        let metric = MetricDatabase::new(
            self.store.clone(),
            self.dimensions.clone(),
            args.type_id,
            args.metric.clone(),
        );
        (metric, EntityRef::new(args.entity, args.type_id))
    }
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let ctx = Context::open(&cli)?;

    match &cli.command {
        Commands::Rows {
            metric: args,
            after,
            before,
            format,
        } => {
            let (metric, entity) = ctx.metric(args);
            let Some(dimension_id) = ctx
                .dimensions
                .lookup(args.dimension.as_deref())
                .map_err(|e| e.to_string())?
            else {
                println!("Dimension {:?} was never recorded", args.dimension);
                return Ok(());
            };
            let series = metric.series(&entity, dimension_id).map_err(|e| e.to_string())?;
            let rows = ctx
                .store
                .rows_between(series.key(), *after, *before)
                .map_err(|e| e.to_string())?;

            if format == "json" {
                let json: Vec<_> = rows
                    .iter()
                    .map(|row| {
                        serde_json::json!({
                            "bucket": row.event_millis(),
                            "cumulative": row.cumulative(),
                            "delta": row.delta(),
                        })
                    })
                    .collect();
                let text = serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?;
                println!("{}", text);
            } else {
                println!("{} rows in {}\n", rows.len(), series.key());
                println!("{:>15} {:>20} {:>20}", "bucket", "cumulative", "delta");
                for row in &rows {
                    println!(
                        "{:>15} {:>20.6} {:>20.6}",
                        row.event_millis(),
                        row.cumulative(),
                        row.delta()
                    );
                }
            }
        }

        Commands::Read {
            metric: args,
            start,
            end,
        } => {
            let (metric, entity) = ctx.metric(args);
            let value = metric
                .metric(&entity, args.dimension.as_deref(), *start, *end)
                .map_err(|e| e.to_string())?;
            match value {
                Some(value) => println!("{}", value),
                None => println!("no data"),
            }
        }

        Commands::Timeline {
            metric: args,
            interval,
            start,
            end,
        } => {
            let (metric, entity) = ctx.metric(args);
            let timeline = metric
                .timeline(&entity, args.dimension.as_deref(), *start, *end, *interval)
                .map_err(|e| e.to_string())?;
            for (bucket, value) in timeline {
                println!("{:>15} {:>20.6}", bucket, value);
            }
        }

        Commands::Reconstruct { metric: args } => {
            let (metric, entity) = ctx.metric(args);
            let fixed = metric.reconstruct(&entity).map_err(|e| e.to_string())?;
            println!("Reconstructed {} rows", fixed);
        }

        Commands::Symbols => {
            for symbol in ctx.store.symbols().map_err(|e| e.to_string())? {
                println!("{:>6}  {}", symbol.id, symbol.name);
            }
        }

        Commands::Stats => {
            let stats = ctx.store.stats().map_err(|e| e.to_string())?;
            println!("Store Statistics\n");
            println!("Metric rows:      {}", stats.metric_rows);
            println!("Dimension values: {}", stats.dimensions);
            println!("Count rows:       {}", stats.count_rows);
            println!("Symbols:          {}", stats.symbols);
        }
    }

    Ok(())
}
