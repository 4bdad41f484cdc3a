// =============================================================================
// CSV file source: replays klines previously exported to disk
// =============================================================================
//
// Layout: one file per symbol, `<base_path>/<SYMBOL>.csv`, with a header row:
//
//   open_time,open,high,low,close,volume,close_time,quote_asset_volume,
//   number_of_trades,taker_buy_base_volume,taker_buy_quote_volume
//
// Times are millisecond epochs, prices and volumes decimal strings.  Rows
// outside `[start_time, end_time)` are dropped; the rest must already be in
// ascending open-time order.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::{params_mismatch, DataSource, SourceBatch};
use crate::config::{FetchParams, FileFetchParams};
use crate::error::FetchError;
use crate::market_data::{Candle, SymbolSeries};

/// One CSV row, as written by an export.
#[derive(Debug, Deserialize)]
struct CsvCandle {
    open_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    volume: Decimal,
    close_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    quote_asset_volume: Decimal,
    number_of_trades: u64,
    #[serde(with = "rust_decimal::serde::str")]
    taker_buy_base_volume: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    taker_buy_quote_volume: Decimal,
}

impl CsvCandle {
    fn into_candle(self, row: usize) -> Result<Candle, FetchError> {
        let millis = |ms: i64, field: &str| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| FetchError::Parse(format!("row {row}: {field} out of range: {ms}")))
        };

        Ok(Candle {
            open_time: millis(self.open_time, "open_time")?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            close_time: millis(self.close_time, "close_time")?,
            quote_asset_volume: self.quote_asset_volume,
            number_of_trades: self.number_of_trades,
            taker_buy_base_volume: self.taker_buy_base_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
        })
    }
}

/// Data source reading per-symbol CSV files from a directory.
#[derive(Debug, Clone)]
pub struct FileDataSource {
    base_path: PathBuf,
}

impl FileDataSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of the file holding `symbol`, refusing anything that could
    /// escape `base_path`.
    fn symbol_path(&self, symbol: &str) -> Result<PathBuf, FetchError> {
        if symbol.contains(['/', '\\']) || symbol.contains("..") {
            return Err(FetchError::Validation(format!(
                "symbol '{symbol}' is not a valid file name"
            )));
        }
        Ok(self.base_path.join(format!("{symbol}.csv")))
    }
}

/// Read and normalize one CSV file, keeping rows inside `[start, end)`.
fn load_series(
    path: &Path,
    symbol: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<SymbolSeries, FetchError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        FetchError::Transport(format!("failed to open {}: {e}", path.display()))
    })?;

    let mut candles = Vec::new();
    for (i, record) in reader.deserialize::<CsvCandle>().enumerate() {
        let row = i + 1;
        let raw = record.map_err(|e| {
            if e.is_io_error() {
                FetchError::Transport(format!("failed to read {}: {e}", path.display()))
            } else {
                FetchError::Parse(format!("{}: row {row}: {e}", path.display()))
            }
        })?;
        let candle = raw.into_candle(row)?;

        if start.is_some_and(|s| candle.open_time < s) || end.is_some_and(|e| candle.open_time >= e) {
            continue;
        }
        candles.push(candle);
    }

    Ok(SymbolSeries::new(symbol, candles)?)
}

#[async_trait]
impl DataSource for FileDataSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, params: &FetchParams) -> Result<SourceBatch, FetchError> {
        let FetchParams::File(p) = params else {
            return Err(params_mismatch("file", "file", params));
        };
        p.validate()?;

        let FileFetchParams {
            symbols,
            start_time,
            end_time,
        } = p.clone();
        let paths = symbols
            .iter()
            .map(|s| self.symbol_path(s))
            .collect::<Result<Vec<_>, _>>()?;

        // csv is a blocking reader; keep it off the async workers.
        let series = tokio::task::spawn_blocking(move || {
            symbols
                .iter()
                .zip(paths.iter())
                .map(|(symbol, path)| {
                    load_series(
                        path,
                        symbol,
                        start_time.map(|t| t.at()),
                        end_time.map(|t| t.at()),
                    )
                    .map(|s| (symbol.clone(), s))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| FetchError::Transport(format!("file reader task failed: {e}")))??;

        for (symbol, s) in &series {
            debug!(symbol = %symbol, rows = s.len(), base_path = %self.base_path.display(), "symbol loaded");
        }

        Ok(SourceBatch::new(series.into_iter().collect()))
    }
}

// =============================================================================
// Tests
// =============================================================================
