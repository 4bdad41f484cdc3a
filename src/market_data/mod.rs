pub mod candle;
pub mod kline;

// Re-export the tabular model for convenient access (e.g. `use crate::market_data::SymbolSeries`).
pub use candle::{Candle, IngestionResult, OrderingError, SymbolSeries, SymbolSeriesMap};
