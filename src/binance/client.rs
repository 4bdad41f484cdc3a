// =============================================================================
// Binance REST API Client: public market-data endpoints
// =============================================================================
//
// Only the kline endpoint is used, which is public, so requests are never
// signed.  The API key is still attached as `X-MBX-APIKEY` when one is
// configured: Binance then accounts weight against the key instead of the
// bare IP.
//
// Pagination lives here: `get_historical_klines` walks a `[start, end)`
// window page by page, so callers see one contiguous, ascending response.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::interval::KlineInterval;
use super::rate_limit::{RateLimitTracker, KLINES_REQUEST_WEIGHT};
use crate::error::FetchError;

/// Production spot REST endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Largest page Binance serves from `/api/v3/klines`.
pub const MAX_KLINES_PER_PAGE: u32 = 1000;

/// Binance REST API client for market data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    page_limit: u32,
    has_api_key: bool,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key`: optional Binance API key (sent as a header, never in
    ///   query params). Blank keys are treated as absent.
    /// * `base_url`: REST root, e.g. [`DEFAULT_BASE_URL`] or a testnet URL.
    pub fn new(api_key: Option<&str>, base_url: impl Into<String>) -> Result<Self, FetchError> {
        let mut default_headers = HeaderMap::new();
        let api_key = api_key.map(str::trim).filter(|k| !k.is_empty());
        if let Some(key) = api_key {
            let val = HeaderValue::from_str(key)
                .map_err(|_| FetchError::Validation("API key is not a valid header value".into()))?;
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, has_api_key = api_key.is_some(), "BinanceClient initialised");

        Ok(Self {
            base_url,
            page_limit: MAX_KLINES_PER_PAGE,
            has_api_key: api_key.is_some(),
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    /// Override the page size used by [`Self::get_historical_klines`].
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.clamp(1, MAX_KLINES_PER_PAGE);
        self
    }

    /// Share a rate-limit tracker with other clients hitting the same IP.
    pub fn with_rate_limit(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        self.rate_limit = tracker;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public, no signature required).
    ///
    /// Returns the raw positional rows; normalization is the caller's job.
    /// `start_ms` and `end_ms` are both inclusive, as on the wire.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}/api/v3/klines", self.base_url);

        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(s) = start_ms {
            query.push(("startTime", s.to_string()));
        }
        if let Some(e) = end_ms {
            query.push(("endTime", e.to_string()));
        }

        self.rate_limit.acquire(KLINES_REQUEST_WEIGHT).await;

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| FetchError::Transport(format!("GET /api/v3/klines failed: {e}")))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(symbol, status = status.as_u16(), "klines request rejected");
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(format!("failed to parse klines response: {e}")))?;

        let rows = match body {
            Value::Array(rows) => rows,
            other => {
                return Err(FetchError::Parse(format!(
                    "klines response is not an array: {other}"
                )))
            }
        };

        debug!(symbol, interval = %interval, count = rows.len(), "klines page fetched");
        Ok(rows)
    }

    /// Fetch every kline whose open time falls in `[start, end)`.
    ///
    /// Pages are requested with `startTime` advanced to one millisecond past
    /// the last open time received, until a short page comes back or the
    /// window is exhausted.  A missing `end` means "up to now".
    #[instrument(skip(self), name = "binance::get_historical_klines")]
    pub async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, FetchError> {
        let end_ms = end.map(|e| e.timestamp_millis());
        // The wire bound is inclusive; ours is not.
        let wire_end = end_ms.map(|e| e - 1);

        let mut cursor = start.timestamp_millis();
        let mut rows: Vec<Value> = Vec::new();
        let mut pages = 0usize;

        loop {
            if matches!(end_ms, Some(e) if cursor >= e) {
                break;
            }

            let page = self
                .get_klines(symbol, interval, Some(cursor), wire_end, self.page_limit)
                .await?;
            pages += 1;

            let Some(last) = page.last() else {
                break;
            };
            let last_open = last
                .get(0)
                .and_then(Value::as_i64)
                .ok_or_else(|| FetchError::Parse(format!("kline row without open time: {last}")))?;

            let short_page = page.len() < self.page_limit as usize;
            rows.extend(page);

            if short_page {
                break;
            }
            cursor = last_open + 1;
        }

        debug!(
            symbol,
            interval = %interval,
            pages,
            count = rows.len(),
            "historical klines fetched"
        );
        Ok(rows)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &if self.has_api_key { "<redacted>" } else { "<none>" })
            .field("base_url", &self.base_url)
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
