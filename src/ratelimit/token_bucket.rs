//! Token bucket.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::limiter::{require_positive, require_positive_rate, Algorithm, RateLimiter};
use crate::error::Result;

/// Continuous refill bucket allowing bursts up to `capacity`.
///
/// The bucket starts full. Each call first adds `elapsed_ms * rate / 1000`
/// tokens (capped at capacity), then spends one token if at least one is
/// available.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_per_milli: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

impl TokenBucket {
    /// Create a bucket of `capacity` tokens refilled at `refill_rate_per_second`.
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Result<Self> {
        Self::with_clock(capacity, refill_rate_per_second, Arc::new(SystemClock))
    }

    /// Create a bucket reading time from `clock`.
    pub fn with_clock(
        capacity: u64,
        refill_rate_per_second: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        require_positive("capacity", capacity)?;
        require_positive_rate("refill_rate_per_second", refill_rate_per_second)?;
        Ok(Self::build(capacity, refill_rate_per_second, clock))
    }

    pub(crate) fn build(capacity: u64, refill_rate_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        let last_refill = clock.now_millis();
        Self {
            capacity,
            refill_per_milli: refill_rate_per_second / 1000.0,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill,
            }),
        }
    }

    /// Decide a request arriving at `now`.
    pub fn allow_request_at(&self, now: u64) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_sub(state.last_refill);
        let refilled = elapsed as f64 * self.refill_per_milli;
        state.tokens = (state.tokens + refilled).min(self.capacity as f64);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            trace!(tokens = state.tokens, "Token bucket allowed");
            true
        } else {
            trace!(tokens = state.tokens, "Token bucket denied");
            false
        }
    }

    /// Tokens currently in the bucket, as of the last call.
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }
}

impl RateLimiter for TokenBucket {
    fn allow_request(&self) -> bool {
        self.allow_request_at(self.clock.now_millis())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}
