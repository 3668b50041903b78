//! Sliding window counter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::limiter::{duration_millis, require_positive, Algorithm, RateLimiter};
use crate::error::Result;

/// Approximates a sliding window from the current and previous window counts.
///
/// The previous window's count decays linearly over the current window:
///
/// ```text
/// weight    = (window - elapsed) / window
/// effective = previous * weight + current
/// ```
///
/// A request is denied when `effective >= limit`. Only admitted requests are
/// counted.
#[derive(Debug)]
pub struct SlidingWindowCounter {
    limit: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<CounterState>,
}

#[derive(Debug)]
struct CounterState {
    current_window_start: u64,
    current_count: u64,
    previous_count: u64,
}

impl SlidingWindowCounter {
    /// Create a counter admitting roughly `limit` requests per sliding `window`.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    /// Create a counter reading time from `clock`.
    pub fn with_clock(limit: u64, window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        require_positive("limit", limit)?;
        let window_ms = duration_millis("window", window)?;
        Ok(Self::build(limit, window_ms, clock))
    }

    pub(crate) fn build(limit: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let current_window_start = clock.now_millis();
        Self {
            limit,
            window_ms,
            clock,
            state: Mutex::new(CounterState {
                current_window_start,
                current_count: 0,
                previous_count: 0,
            }),
        }
    }

    /// Decide a request arriving at `now`.
    pub fn allow_request_at(&self, now: u64) -> bool {
        let mut state = self.state.lock();

        // Saturating keeps a backwards clock step at zero elapsed, so the
        // weight below always stays within [0, 1].
        let mut elapsed = now.saturating_sub(state.current_window_start);
        if elapsed >= self.window_ms {
            state.previous_count = state.current_count;
            state.current_count = 0;
            state.current_window_start = now;
            elapsed = 0;
        }

        let weight = (self.window_ms - elapsed) as f64 / self.window_ms as f64;
        let effective = state.previous_count as f64 * weight + state.current_count as f64;

        if effective >= self.limit as f64 {
            trace!(effective, limit = self.limit, "Sliding counter denied");
            return false;
        }

        state.current_count += 1;
        trace!(effective, limit = self.limit, "Sliding counter allowed");
        true
    }
}

impl RateLimiter for SlidingWindowCounter {
    fn allow_request(&self) -> bool {
        self.allow_request_at(self.clock.now_millis())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowCounter
    }
}
