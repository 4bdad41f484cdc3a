// =============================================================================
// Binance historical-candle source
// =============================================================================
//
// For each symbol, in the order given: download every kline in the
// `[start_time, end_time)` window, normalize the rows, and key the series by
// symbol.  Pagination and request-weight accounting belong to the feed (the
// REST client), not to this source.
//
// Failure policy is per task (`on_symbol_error`):
//   fail_task  the first failing symbol fails the whole call (default)
//   skip       the symbol is dropped and recorded in `SourceBatch::skipped`;
//              the call only fails if every symbol failed
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::{params_mismatch, DataSource, SourceBatch};
use crate::binance::{BinanceClient, KlineInterval};
use crate::config::{ExchangeFetchParams, FetchParams, SymbolErrorPolicy};
use crate::error::FetchError;
use crate::market_data::kline::parse_klines;
use crate::market_data::SymbolSeries;

/// Anything that can hand back raw kline rows for a window.
#[async_trait]
pub trait KlineFeed: Send + Sync {
    async fn historical_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, FetchError>;
}

#[async_trait]
impl KlineFeed for BinanceClient {
    async fn historical_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, FetchError> {
        self.get_historical_klines(symbol, interval, start, end).await
    }
}

/// Data source backed by the Binance kline endpoint.
pub struct BinanceDataSource<F = BinanceClient> {
    feed: F,
}

impl BinanceDataSource {
    pub fn new(client: BinanceClient) -> Self {
        Self { feed: client }
    }
}

impl<F: KlineFeed> BinanceDataSource<F> {
    /// Build the source on top of any feed (an alternative transport, or a
    /// canned feed in tests).
    pub fn with_feed(feed: F) -> Self {
        Self { feed }
    }

    async fn fetch_symbol(
        &self,
        symbol: &str,
        params: &ExchangeFetchParams,
    ) -> Result<SymbolSeries, FetchError> {
        let rows = self
            .feed
            .historical_klines(
                symbol,
                params.interval,
                params.start_time.at(),
                params.end_time.map(|t| t.at()),
            )
            .await?;

        Ok(parse_klines(symbol, &rows)?)
    }
}

#[async_trait]
impl<F: KlineFeed> DataSource for BinanceDataSource<F> {
    fn kind(&self) -> &'static str {
        "binance"
    }

    async fn fetch(&self, params: &FetchParams) -> Result<SourceBatch, FetchError> {
        let FetchParams::Exchange(p) = params else {
            return Err(params_mismatch("binance", "exchange", params));
        };
        p.validate()?;

        let mut batch = SourceBatch::default();

        for symbol in &p.symbols {
            match self.fetch_symbol(symbol, p).await {
                Ok(series) => {
                    debug!(symbol = %symbol, interval = %p.interval, rows = series.len(), "symbol fetched");
                    batch.series.insert(symbol.clone(), series);
                }
                Err(e) if p.on_symbol_error == SymbolErrorPolicy::Skip => {
                    warn!(symbol = %symbol, error = %e, "symbol failed; skipping");
                    batch.skipped.insert(symbol.clone(), e);
                }
                Err(e) => return Err(e),
            }
        }

        if batch.series.is_empty() {
            // Every symbol failed under `skip`: surface the first one.
            if let Some(err) = p.symbols.first().and_then(|s| batch.skipped.remove(s)) {
                return Err(err);
            }
        }

        Ok(batch)
    }
}

// =============================================================================
// Tests
// =============================================================================
