//! Request-weight budget for exchange REST traffic
//!
//! The exchange prices REST calls in request weight per minute, not a flat
//! request count: a depth-5000 snapshot costs 250 while the symbol listing
//! costs 20. Callers spend weight cells against a GCRA budget (governor
//! crate), so a run of heavy snapshot fetches blocks client-side before the
//! exchange would answer 429.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RestError;

/// Weight spent per minute, kept at half the exchange's 6000 hard cap.
const WEIGHT_PER_MINUTE: u32 = 3000;

/// Burst headroom: two full-depth snapshots back to back.
const BURST_WEIGHT: u32 = 500;

/// Longest a caller waits for weight to replenish.
const MAX_WAIT: Duration = Duration::from_secs(30);

/// Weight of `GET /api/v3/exchangeInfo`.
pub const EXCHANGE_INFO_WEIGHT: u32 = 20;

/// Weight of `GET /api/v3/depth` at the given limit, per the exchange's
/// weight table.
pub fn depth_weight(limit: u32) -> u32 {
    match limit {
        0..=100 => 5,
        101..=500 => 25,
        501..=1000 => 50,
        _ => 250,
    }
}

/// Weight budget shared by all REST calls of one client.
pub struct RestRateLimiter {
    budget: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_wait: Duration,
}

impl RestRateLimiter {
    pub fn new() -> Self {
        Self::with_budget(WEIGHT_PER_MINUTE, BURST_WEIGHT, MAX_WAIT)
    }

    pub fn with_budget(weight_per_minute: u32, burst_weight: u32, max_wait: Duration) -> Self {
        let replenish = NonZeroU32::new(weight_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst_weight.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            budget: RateLimiter::direct(Quota::per_minute(replenish).allow_burst(burst)),
            max_wait,
        }
    }

    /// Spend `weight` against the budget, waiting for replenishment up to
    /// the deadline.
    pub async fn acquire(&self, weight: u32) -> Result<(), RestError> {
        let cells = NonZeroU32::new(weight.max(1)).unwrap_or(NonZeroU32::MIN);

        match timeout(self.max_wait, self.budget.until_n_ready(cells)).await {
            Ok(Ok(())) => {
                debug!(weight, "Request weight granted");
                Ok(())
            }
            Ok(Err(_)) => Err(RestError::RateLimit(format!(
                "request weight {weight} exceeds the burst budget"
            ))),
            Err(_) => {
                warn!(
                    weight,
                    wait_secs = self.max_wait.as_secs(),
                    "Gave up waiting for request weight"
                );
                Err(RestError::RateLimit(format!(
                    "weight {} not replenished within {}s",
                    weight,
                    self.max_wait.as_secs()
                )))
            }
        }
    }
}

impl Default for RestRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
