// =============================================================================
// Rate-Limit Tracker: keeps historical kline downloads under Binance's
// request-weight budget
// =============================================================================
//
// Binance caps request weight at 6000 per minute per IP for the spot API; we
// hard-cap ourselves well below that.  After every response the tracker reads
// the `X-MBX-USED-WEIGHT-1M` header and stores it in an atomic, so one
// tracker can be shared by every task fetching through the same client.
//
// When the next request would exceed the cap, `acquire` parks the caller
// until the next minute boundary, when Binance resets the counter.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{Timelike, Utc};
use tracing::{debug, warn};

/// Hard ceiling at which we stop sending requests until the window resets.
const WEIGHT_HARD_LIMIT: u32 = 5000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 4000;

/// Weight of one `GET /api/v3/klines` call (any limit).
pub const KLINES_REQUEST_WEIGHT: u32 = 2;

/// Thread-safe request-weight tracker backed by an atomic counter.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    hard_limit: u32,
}

impl RateLimitTracker {
    /// Create a new tracker with the default hard limit.
    pub fn new() -> Self {
        Self::with_limit(WEIGHT_HARD_LIMIT)
    }

    /// Create a tracker with a custom hard limit.
    pub fn with_limit(hard_limit: u32) -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            hard_limit,
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update the weight counter from the HTTP response headers returned by
    /// Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = self.hard_limit,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        self.used_weight_1m
            .load(Ordering::Relaxed)
            .saturating_add(weight)
            <= self.hard_limit
    }

    /// Reserve `weight` if it fits under the hard limit.  Check and reserve
    /// are one atomic step, so concurrent callers cannot overshoot together.
    pub fn try_reserve(&self, weight: u32) -> bool {
        self.used_weight_1m
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.saturating_add(weight);
                (next <= self.hard_limit).then_some(next)
            })
            .is_ok()
    }

    /// Wait until `weight` can be spent, then reserve it locally so that
    /// concurrent callers see the pending spend before the next header update.
    pub async fn acquire(&self, weight: u32) {
        while !self.try_reserve(weight) {
            let wait = until_next_minute();
            warn!(
                current_weight = self.used_weight(),
                requested_weight = weight,
                hard_limit = self.hard_limit,
                wait_ms = wait.as_millis() as u64,
                "request weight exhausted; waiting for the next window"
            );
            tokio::time::sleep(wait).await;
            self.reset_1m_weight();
        }
    }

    /// Reset the 1-minute weight counter.
    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    /// Last known used weight for the current minute.
    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .field("hard_limit", &self.hard_limit)
            .finish()
    }
}

/// Time left until the next wall-clock minute, plus a small margin.
fn until_next_minute() -> Duration {
    let now = Utc::now();
    let elapsed_ms = u64::from(now.second()) * 1000 + u64::from(now.timestamp_subsec_millis());
    Duration::from_millis(60_000u64.saturating_sub(elapsed_ms) + 250)
}
