// =============================================================================
// Data Sources: the pluggable providers the orchestrator dispatches to
// =============================================================================
//
// A source turns a typed parameter bag into per-symbol series.  It owns all
// source-specific work (validation, transport, normalization); the
// orchestrator only sees a `SourceBatch` or a single `FetchError`.
//
// Sources are shared across tasks (and, with concurrency enabled, across
// in-flight fetches), so implementations must be `Send + Sync` and must not
// carry per-call mutable state.
// =============================================================================

pub mod binance;
pub mod file;
pub mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::FetchParams;
use crate::error::FetchError;
use crate::market_data::SymbolSeriesMap;

pub use binance::{BinanceDataSource, KlineFeed};
pub use file::FileDataSource;
pub use registry::{SourceRegistry, SourceRegistryBuilder};

/// What one successful fetch produced.
#[derive(Debug, Default)]
pub struct SourceBatch {
    /// Series for every symbol fetched, keyed by symbol.
    pub series: SymbolSeriesMap,
    /// Symbols dropped under a lenient failure policy, with the reason.
    pub skipped: BTreeMap<String, FetchError>,
}

impl SourceBatch {
    pub fn new(series: SymbolSeriesMap) -> Self {
        Self {
            series,
            skipped: BTreeMap::new(),
        }
    }

    /// Total rows across all symbols.
    pub fn total_rows(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }
}

/// A provider of market data.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short label of the implementation, for logs.
    fn kind(&self) -> &'static str;

    /// Fetch every symbol named in `params`.
    async fn fetch(&self, params: &FetchParams) -> Result<SourceBatch, FetchError>;
}

/// Error for a source handed a parameter variant it does not understand.
pub(crate) fn params_mismatch(source: &str, expected: &str, got: &FetchParams) -> FetchError {
    FetchError::Validation(format!(
        "{source} source expects {expected} params, got {} params",
        got.kind()
    ))
}
