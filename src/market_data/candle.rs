// =============================================================================
// Candle & SymbolSeries: normalized tabular market data
// =============================================================================
//
// Every data source, whatever its wire format, hands the orchestrator the
// same shape: one `SymbolSeries` per symbol, each an immutable run of
// `Candle` rows indexed by open time.
//
// Invariant: open times inside a series are unique and strictly ascending.
// `SymbolSeries::new` refuses anything else, so downstream code never has to
// re-check ordering.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV observation for a fixed time interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
    pub quote_asset_volume: Decimal,
    pub number_of_trades: u64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

/// Error raised when a candle sequence breaks the ordering invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{symbol}: open time {current} at row {index} does not follow {previous}")]
pub struct OrderingError {
    pub symbol: String,
    pub index: usize,
    pub previous: DateTime<Utc>,
    pub current: DateTime<Utc>,
}

/// Ordered, immutable time series of candles for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolSeries {
    symbol: String,
    candles: Vec<Candle>,
}

/// Per-symbol series produced by a single fetch.
pub type SymbolSeriesMap = BTreeMap<String, SymbolSeries>;

/// Aggregate result of one ingestion run: task name → symbol → series.
pub type IngestionResult = BTreeMap<String, SymbolSeriesMap>;

// ---------------------------------------------------------------------------
// SymbolSeries
// ---------------------------------------------------------------------------

impl SymbolSeries {
    /// Build a series, checking that open times strictly increase.
    pub fn new(symbol: impl Into<String>, candles: Vec<Candle>) -> Result<Self, OrderingError> {
        let symbol = symbol.into();

        for (index, pair) in candles.windows(2).enumerate() {
            if pair[1].open_time <= pair[0].open_time {
                return Err(OrderingError {
                    symbol,
                    index: index + 1,
                    previous: pair[0].open_time,
                    current: pair[1].open_time,
                });
            }
        }

        Ok(Self { symbol, candles })
    }

    /// Series with no rows.
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            candles: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candle> {
        self.candles.iter()
    }

    /// First and last open time, if the series has any rows.
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.candles.first(), self.candles.last()) {
            (Some(first), Some(last)) => Some((first.open_time, last.open_time)),
            _ => None,
        }
    }

    /// Look up the row whose open time equals `open_time` (binary search on
    /// the index).
    pub fn get(&self, open_time: DateTime<Utc>) -> Option<&Candle> {
        self.candles
            .binary_search_by(|c| c.open_time.cmp(&open_time))
            .ok()
            .map(|i| &self.candles[i])
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_candle(open_ms: i64, close: Decimal) -> Candle {
        Candle {
            open_time: Utc.timestamp_millis_opt(open_ms).unwrap(),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(100),
            close_time: Utc.timestamp_millis_opt(open_ms + 59_999).unwrap(),
            quote_asset_volume: dec!(200),
            number_of_trades: 50,
            taker_buy_base_volume: dec!(60),
            taker_buy_quote_volume: dec!(120),
        }
    }

    #[test]
    fn ascending_series_is_accepted() {
        let candles = (0..5)
            .map(|i| sample_candle(i * 60_000, dec!(100) + Decimal::from(i)))
            .collect();
        let series = SymbolSeries::new("BTCUSDT", candles).unwrap();

        assert_eq!(series.len(), 5);
        assert_eq!(series.symbol(), "BTCUSDT");
        assert_eq!(series.last().unwrap().close, dec!(104));
        for pair in series.candles().windows(2) {
            assert!(pair[0].open_time < pair[1].open_time);
        }
    }

    #[test]
    fn duplicate_open_time_is_rejected() {
        let candles = vec![
            sample_candle(0, dec!(1)),
            sample_candle(60_000, dec!(2)),
            sample_candle(60_000, dec!(3)),
        ];
        let err = SymbolSeries::new("ETHUSDT", candles).unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.symbol, "ETHUSDT");
    }

    #[test]
    fn descending_open_time_is_rejected() {
        let candles = vec![sample_candle(120_000, dec!(1)), sample_candle(60_000, dec!(2))];
        assert!(SymbolSeries::new("ETHUSDT", candles).is_err());
    }

    #[test]
    fn lookup_by_open_time() {
        let candles = (0..3).map(|i| sample_candle(i * 60_000, dec!(10))).collect();
        let series = SymbolSeries::new("BNBUSDT", candles).unwrap();
        let t = Utc.timestamp_millis_opt(60_000).unwrap();

        assert_eq!(series.get(t).map(|c| c.open_time), Some(t));
        assert!(series.get(Utc.timestamp_millis_opt(30_000).unwrap()).is_none());
    }

    #[test]
    fn empty_series_has_no_range() {
        let series = SymbolSeries::empty("XYZUSDT");
        assert!(series.is_empty());
        assert_eq!(series.time_range(), None);
    }
}
