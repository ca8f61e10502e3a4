//! Incremental per-pair network flow statistics
//!
//! Raw flow-record files are reduced to daily per-(source, destination)
//! totals, and every daily summary is folded into a single aggregate table
//! holding the count, mean and sample standard deviation of each pair's daily
//! totals. The table stores only derived statistics; the running accumulator
//! is rebuilt from them on every merge, so history is never re-read.
//!
//! The pipeline stages talk through an [`ObjectStore`](store::ObjectStore)
//! and at-least-once [`MessageQueue`](queue::MessageQueue)s. Consolidation
//! commits with conditional puts and records every merged summary in a
//! processed ledger, so concurrent and redelivered triggers are both safe.
//!
//! # Example
//!
//! ```
//! use pairflow::model::{DailyPairTotal, DailySummary, DayPairKey, PairKey};
//! use pairflow::consolidate::merge_summary;
//! use pairflow::table::AggregateTable;
//! use chrono::NaiveDate;
//!
//! let pair = PairKey::new("10.0.0.1", "10.0.0.2");
//! let day = |d| DayPairKey::new(NaiveDate::from_ymd_opt(2024, 3, d).unwrap(), pair.clone());
//!
//! let first: DailySummary = vec![(day(1), DailyPairTotal::new(100, 10))].into_iter().collect();
//! let second: DailySummary = vec![(day(2), DailyPairTotal::new(200, 30))].into_iter().collect();
//!
//! let (table, _) = merge_summary(&AggregateTable::new(), &first);
//! let (table, _) = merge_summary(&table, &second);
//!
//! let row = table.get(&pair).unwrap();
//! assert_eq!(row.count, 2);
//! assert_eq!(row.avg_flow_duration, 150.0);
//! assert!((row.std_flow_duration - 70.710678).abs() < 1e-6);
//! ```
//!
//! # Running the pipeline
//!
//! ```no_run
//! use pairflow::{Pipeline, PipelineConfig};
//!
//! # async fn example() -> pairflow::Result<()> {
//! let config = PipelineConfig::builder().data_dir("data").build()?;
//! let pipeline = Pipeline::open(config).await?;
//!
//! pipeline.uploader().upload_dir("incoming".as_ref()).await?;
//! pipeline.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

pub use config::PipelineConfig;
pub use error::{ErrorSeverity, ParseError, PipelineError, Result};
pub use pipeline::Pipeline;

/// Configuration
pub mod config;

/// Incremental consolidation engine
pub mod consolidate;

/// Error types
pub mod error;

/// Per-pair exports
pub mod export;

/// Trigger payloads
pub mod message;

/// Domain types
pub mod model;

/// Local pipeline wiring
pub mod pipeline;

/// At-least-once message queues
pub mod queue;

/// Raw flow record reduction
pub mod reducer;

/// Conflict retry policy
pub mod retry;

/// Running statistics
pub mod stats;

/// Object storage
pub mod store;

/// Persisted table formats
pub mod table;

/// Raw file uploads
pub mod upload;

/// Queue workers
pub mod worker;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber
///
/// Honours `RUST_LOG`, defaulting to `info`. With `json` set, events are
/// written as JSON lines. Output goes to stderr, leaving stdout to commands
/// that print data.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
