// =============================================================================
// Startup wiring: config → concrete sources → registry
// =============================================================================
//
// The only module besides `main` that reads the environment.  Blank Binance
// credentials in the config fall back to `BINANCE_API_KEY` and
// `BINANCE_API_SECRET`.  The Binance source is always registered (klines are
// public market data); the file source only when a `file` block is present.
// =============================================================================

use tracing::info;

use crate::binance::BinanceClient;
use crate::config::{BinanceConfig, IngestionConfig, BINANCE_SOURCE, FILE_SOURCE};
use crate::error::FetchError;
use crate::sources::{BinanceDataSource, FileDataSource, SourceRegistry};

pub const API_KEY_ENV: &str = "BINANCE_API_KEY";
pub const API_SECRET_ENV: &str = "BINANCE_API_SECRET";

/// Fill blank credentials from `env`.
///
/// The secret is resolved but nothing consumes it: kline requests are public
/// and never signed, so only the key reaches the client.
pub fn resolve_binance_config(
    config: Option<&BinanceConfig>,
    env: impl Fn(&str) -> Option<String>,
) -> BinanceConfig {
    let mut resolved = config.cloned().unwrap_or_default();

    if resolved.api_key.trim().is_empty() {
        resolved.api_key = env(API_KEY_ENV).unwrap_or_default();
    }
    if resolved.api_secret.trim().is_empty() {
        resolved.api_secret = env(API_SECRET_ENV).unwrap_or_default();
    }
    resolved
}

/// Build the registry from the process environment.
pub fn build_registry(config: &IngestionConfig) -> Result<SourceRegistry, FetchError> {
    build_registry_with_env(config, |key| std::env::var(key).ok())
}

pub fn build_registry_with_env(
    config: &IngestionConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SourceRegistry, FetchError> {
    let binance = resolve_binance_config(config.binance.as_ref(), env);
    let client = BinanceClient::new(Some(binance.api_key.as_str()), binance.base_url.as_str())?;
    info!(
        base_url = %client.base_url(),
        authenticated = !binance.api_key.trim().is_empty(),
        "binance source configured"
    );

    let mut builder =
        SourceRegistry::builder().register(BINANCE_SOURCE, BinanceDataSource::new(client));

    if let Some(file) = &config.file {
        info!(base_path = %file.base_path.display(), "file source configured");
        builder = builder.register(FILE_SOURCE, FileDataSource::new(&file.base_path));
    }

    Ok(builder.build())
}
