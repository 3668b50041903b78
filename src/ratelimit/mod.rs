//! Admission control: rate limiting algorithms and the per-key registry.

mod clock;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod registry;
mod sliding_counter;
mod sliding_log;
mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::FixedWindowCounter;
pub use leaky_bucket::LeakyBucket;
pub use limiter::{Algorithm, LimiterConfig, LimiterFactory, RateLimiter};
pub use registry::{EvictionTask, LimiterRegistry};
pub use sliding_counter::SlidingWindowCounter;
pub use sliding_log::SlidingWindowLog;
pub use token_bucket::TokenBucket;
