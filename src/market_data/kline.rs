// =============================================================================
// Kline normalization: Binance positional arrays into `Candle` rows
// =============================================================================
//
// Binance answers `GET /api/v3/klines` with an array of 12-element arrays:
//
//   [0] openTime (ms)     [1] open     [2] high     [3] low     [4] close
//   [5] volume            [6] closeTime (ms)        [7] quoteAssetVolume
//   [8] numberOfTrades    [9] takerBuyBaseVolume    [10] takerBuyQuoteVolume
//   [11] ignore
//
// Prices and volumes arrive as JSON strings; they are parsed straight into
// `Decimal` so no precision is lost.  Field 11 is dropped.
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::candle::{Candle, OrderingError, SymbolSeries};

/// Minimum number of positional fields a kline row must carry (the trailing
/// "ignore" field is optional).
const KLINE_MIN_FIELDS: usize = 11;

/// Failure while turning raw kline rows into candles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KlineError {
    #[error("kline row {row} is not an array")]
    NotAnArray { row: usize },

    #[error("kline row {row} has {len} fields, expected at least 11")]
    TooShort { row: usize, len: usize },

    #[error("kline row {row}: field {field} is invalid: {value}")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },

    #[error(transparent)]
    Ordering(#[from] OrderingError),
}

/// Normalize one raw kline row.
pub fn parse_kline_row(row: usize, raw: &Value) -> Result<Candle, KlineError> {
    let arr = raw.as_array().ok_or(KlineError::NotAnArray { row })?;

    if arr.len() < KLINE_MIN_FIELDS {
        return Err(KlineError::TooShort {
            row,
            len: arr.len(),
        });
    }

    Ok(Candle {
        open_time: parse_millis(row, &arr[0], "open_time")?,
        open: parse_decimal(row, &arr[1], "open")?,
        high: parse_decimal(row, &arr[2], "high")?,
        low: parse_decimal(row, &arr[3], "low")?,
        close: parse_decimal(row, &arr[4], "close")?,
        volume: parse_decimal(row, &arr[5], "volume")?,
        close_time: parse_millis(row, &arr[6], "close_time")?,
        quote_asset_volume: parse_decimal(row, &arr[7], "quote_asset_volume")?,
        number_of_trades: parse_u64(row, &arr[8], "number_of_trades")?,
        taker_buy_base_volume: parse_decimal(row, &arr[9], "taker_buy_base_volume")?,
        taker_buy_quote_volume: parse_decimal(row, &arr[10], "taker_buy_quote_volume")?,
    })
}

/// Normalize a full kline response for `symbol`, preserving exchange order.
pub fn parse_klines(symbol: &str, rows: &[Value]) -> Result<SymbolSeries, KlineError> {
    let candles = rows
        .iter()
        .enumerate()
        .map(|(i, raw)| parse_kline_row(i, raw))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SymbolSeries::new(symbol, candles)?)
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn invalid(row: usize, field: &'static str, value: &Value) -> KlineError {
    KlineError::InvalidField {
        row,
        field,
        value: value.to_string(),
    }
}

/// Millisecond epoch, sent as a JSON integer (strings tolerated).
fn parse_millis(row: usize, val: &Value, field: &'static str) -> Result<DateTime<Utc>, KlineError> {
    let ms = match val {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(row, field, val))?;

    DateTime::from_timestamp_millis(ms).ok_or_else(|| invalid(row, field, val))
}

/// Binance sends prices and volumes as JSON strings; plain numbers are
/// accepted too.
fn parse_decimal(row: usize, val: &Value, field: &'static str) -> Result<Decimal, KlineError> {
    let text = match val {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(invalid(row, field, val)),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| invalid(row, field, val))
}

fn parse_u64(row: usize, val: &Value, field: &'static str) -> Result<u64, KlineError> {
    match val {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(row, field, val))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
