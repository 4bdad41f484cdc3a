pub mod client;
pub mod interval;
pub mod rate_limit;

pub use client::BinanceClient;
pub use interval::KlineInterval;
