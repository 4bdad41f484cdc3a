// =============================================================================
// Kline Ingest: configuration-driven historical market-data ingestion
// =============================================================================
//
// A run takes a list of tasks (name, source, params), dispatches each to a
// named data source and collects task → symbol → candle series.  A failing
// task is logged and left out; it never stops the others.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
pub mod binance;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod logging;
pub mod market_data;
pub mod sources;

pub use config::{FetchParams, IngestionConfig, TaskConfig};
pub use error::{ConfigError, FetchError, TaskError};
pub use ingestion::{run, Ingestion, IngestionReport, TaskOutcome};
pub use market_data::{Candle, IngestionResult, SymbolSeries, SymbolSeriesMap};
pub use sources::{DataSource, SourceBatch, SourceRegistry};
