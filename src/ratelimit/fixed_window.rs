//! Fixed window counter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::limiter::{duration_millis, require_positive, Algorithm, RateLimiter};
use crate::error::Result;

/// Counts admissions in discrete windows that reset hard when they expire.
///
/// A window starts at construction and is replaced by a fresh one the first
/// time a request arrives `window` or more after its start. Up to twice the
/// limit can be admitted across a window seam; this is inherent to the
/// algorithm.
#[derive(Debug)]
pub struct FixedWindowCounter {
    limit: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    window_start: u64,
    count: u64,
}

impl FixedWindowCounter {
    /// Create a counter admitting `limit` requests per `window`, on the system clock.
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
        let window_start = clock.now_millis();
        Self {
            limit,
            window_ms,
            clock,
            state: Mutex::new(WindowState {
                window_start,
                count: 0,
            }),
        }
    }

    /// Decide a request arriving at `now`.
    pub fn allow_request_at(&self, now: u64) -> bool {
        let mut state = self.state.lock();

        if now.saturating_sub(state.window_start) >= self.window_ms {
            state.window_start = now;
            state.count = 0;
        }

        state.count += 1;
        let allowed = state.count <= self.limit;
        trace!(count = state.count, limit = self.limit, allowed, "Fixed window decision");
        allowed
    }

    /// The configured admission limit per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl RateLimiter for FixedWindowCounter {
    fn allow_request(&self) -> bool {
        self.allow_request_at(self.clock.now_millis())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
