//! Leaky bucket with a background drain task.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::limiter::{require_leak_rate, require_positive, Algorithm, RateLimiter};
use crate::error::{Result, TurnstileError};

/// A bounded queue drained at a fixed rate by a Tokio task.
///
/// Admission is a non-blocking insert: it succeeds while the queue has room
/// and fails fast when it is full. Every `1000 / leak_rate` milliseconds
/// (integer division) the drain task removes at most one queued entry.
///
/// The drain task lives exactly as long as the bucket. [`shutdown`] stops it
/// and dropping the bucket calls [`shutdown`]. Once `shutdown` returns, no
/// further entry is ever leaked.
///
/// [`shutdown`]: RateLimiter::shutdown
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    leak_interval: Duration,
    clock: Arc<dyn Clock>,
    queue: Arc<Mutex<Queue>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Queue {
    entries: VecDeque<u64>,
    stopped: bool,
}

impl LeakyBucket {
    /// Create a bucket holding `capacity` requests and leaking `leak_rate_per_second`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(capacity: u64, leak_rate_per_second: u32) -> Result<Self> {
        Self::with_clock(capacity, leak_rate_per_second, Arc::new(SystemClock))
    }

    /// Create a bucket stamping queued requests with `clock`.
    pub fn with_clock(
        capacity: u64,
        leak_rate_per_second: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        require_positive("capacity", capacity)?;
        require_leak_rate(leak_rate_per_second)?;
        let runtime = Handle::try_current().map_err(|_| TurnstileError::NoRuntime)?;
        Ok(Self::build(capacity, leak_rate_per_second, clock, &runtime))
    }

    pub(crate) fn build(
        capacity: u64,
        leak_rate_per_second: u32,
        clock: Arc<dyn Clock>,
        runtime: &Handle,
    ) -> Self {
        // Rates that do not divide 1000 truncate, e.g. 3/s leaks every 333ms.
        let leak_interval = Duration::from_millis(u64::from(1000 / leak_rate_per_second));
        let initial = usize::try_from(capacity).unwrap_or(usize::MAX).min(1024);
        let queue = Arc::new(Mutex::new(Queue {
            entries: VecDeque::with_capacity(initial),
            stopped: false,
        }));

        let drain = runtime.spawn(drain_loop(Arc::downgrade(&queue), leak_interval));
        debug!(
            capacity,
            interval_ms = leak_interval.as_millis() as u64,
            "Started leaky bucket drain"
        );

        Self {
            capacity,
            leak_interval,
            clock,
            queue,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Decide a request arriving at `now`.
    pub fn allow_request_at(&self, now: u64) -> bool {
        let mut queue = self.queue.lock();

        if (queue.entries.len() as u64) < self.capacity {
            queue.entries.push_back(now);
            trace!(queued = queue.entries.len(), capacity = self.capacity, "Leaky bucket allowed");
            true
        } else {
            trace!(capacity = self.capacity, "Leaky bucket full");
            false
        }
    }

    /// Time between drain ticks.
    pub fn leak_interval(&self) -> Duration {
        self.leak_interval
    }

    /// Number of requests waiting to leak.
    pub fn queued(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Whether the drain task is still allowed to run.
    pub fn is_draining(&self) -> bool {
        !self.queue.lock().stopped
    }
}

/// Leak one entry per tick until the bucket is stopped or dropped.
async fn drain_loop(weak: Weak<Mutex<Queue>>, period: Duration) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;

        let Some(shared) = weak.upgrade() else {
            break;
        };
        let mut queue = shared.lock();
        if queue.stopped {
            break;
        }
        if let Some(queued_at) = queue.entries.pop_front() {
            trace!(queued_at, remaining = queue.entries.len(), "Leaked one request");
        }
    }
}

impl RateLimiter for LeakyBucket {
    fn allow_request(&self) -> bool {
        self.allow_request_at(self.clock.now_millis())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn shutdown(&self) {
        {
            // Ticks check this flag under the same lock.
            let mut queue = self.queue.lock();
            if queue.stopped {
                return;
            }
            queue.stopped = true;
        }

        if let Some(drain) = self.drain.lock().take() {
            drain.abort();
        }
        debug!(capacity = self.capacity, "Stopped leaky bucket drain");
    }
}

impl Drop for LeakyBucket {
    fn drop(&mut self) {
        self.shutdown();
    }
}
