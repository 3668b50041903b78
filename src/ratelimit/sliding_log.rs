//! Sliding window log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::limiter::{duration_millis, require_positive, Algorithm, RateLimiter};
use crate::error::Result;

/// Exact windowing over a log of admission timestamps.
///
/// The log holds at most `limit` entries, oldest first. Entries older than
/// the window are dropped from the front on every call, and only admitted
/// requests are recorded.
#[derive(Debug)]
pub struct SlidingWindowLog {
    limit: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    log: Mutex<VecDeque<u64>>,
}

impl SlidingWindowLog {
    /// Create a log admitting `limit` requests in any `window`, on the system clock.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    /// Create a log reading time from `clock`.
    pub fn with_clock(limit: u64, window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        require_positive("limit", limit)?;
        let window_ms = duration_millis("window", window)?;
        Ok(Self::build(limit, window_ms, clock))
    }

    pub(crate) fn build(limit: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        // Large limits grow the log on demand.
        let initial = usize::try_from(limit).unwrap_or(usize::MAX).min(1024);
        Self {
            limit,
            window_ms,
            clock,
            log: Mutex::new(VecDeque::with_capacity(initial)),
        }
    }

    /// Decide a request arriving at `now`.
    pub fn allow_request_at(&self, now: u64) -> bool {
        let mut log = self.log.lock();

        // Nothing expires until a full window has passed since time zero.
        if let Some(horizon) = now.checked_sub(self.window_ms) {
            while log.front().map_or(false, |&ts| ts <= horizon) {
                log.pop_front();
            }
        }

        let allowed = (log.len() as u64) < self.limit;
        if allowed {
            log.push_back(now);
        }
        trace!(logged = log.len(), limit = self.limit, allowed, "Sliding log decision");
        allowed
    }

    /// Number of admissions currently inside the window, as of the last call.
    pub fn logged(&self) -> usize {
        self.log.lock().len()
    }
}

impl RateLimiter for SlidingWindowLog {
    fn allow_request(&self) -> bool {
        self.allow_request_at(self.clock.now_millis())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowLog
    }
}
