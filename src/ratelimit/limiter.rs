//! The admission decision contract and limiter construction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::debug;

use super::clock::Clock;
use super::fixed_window::FixedWindowCounter;
use super::leaky_bucket::LeakyBucket;
use super::sliding_counter::SlidingWindowCounter;
use super::sliding_log::SlidingWindowLog;
use super::token_bucket::TokenBucket;
use crate::error::{Result, TurnstileError};

/// Default admissions per window.
const DEFAULT_LIMIT: u64 = 100;
/// Default window length in milliseconds.
const DEFAULT_WINDOW_MS: u64 = 1000;
/// Default bucket size for the bucket algorithms.
const DEFAULT_CAPACITY: u64 = 10;
/// Default token refill rate per second.
const DEFAULT_REFILL_RATE: f64 = 1.0;
/// Default leak rate per second.
const DEFAULT_LEAK_RATE: u32 = 1;
/// Leak intervals are whole milliseconds, so faster rates would truncate to zero.
const MAX_LEAK_RATE_PER_SECOND: u32 = 1000;

/// The admission decision shared by every algorithm.
///
/// Implementations are safe to call from many threads at once. A call never
/// blocks beyond briefly waiting for the instance's own lock and never fails:
/// `false` means the request should be rejected, and callers should not retry
/// internally.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Decide whether a request arriving now is admitted.
    fn allow_request(&self) -> bool;

    /// Which algorithm backs this instance.
    fn algorithm(&self) -> Algorithm;

    /// Release background resources. Idempotent.
    fn shutdown(&self) {}
}

/// Available admission algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindowLog,
    SlidingWindowCounter,
    TokenBucket,
    LeakyBucket,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::SlidingWindowCounter => "sliding_window_counter",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// Construction parameters for a limiter.
///
/// Each algorithm reads only the fields it needs:
/// - window algorithms: `limit`, `window_ms`
/// - token bucket: `capacity`, `refill_rate_per_second`
/// - leaky bucket: `capacity`, `leak_rate_per_second`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Which algorithm to build
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Maximum admissions per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Bucket size
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,

    /// Queued requests drained per second
    #[serde(default = "default_leak_rate")]
    pub leak_rate_per_second: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            limit: default_limit(),
            window_ms: default_window_ms(),
            capacity: default_capacity(),
            refill_rate_per_second: default_refill_rate(),
            leak_rate_per_second: default_leak_rate(),
        }
    }
}

fn default_algorithm() -> Algorithm {
    Algorithm::FixedWindow
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}

fn default_refill_rate() -> f64 {
    DEFAULT_REFILL_RATE
}

fn default_leak_rate() -> u32 {
    DEFAULT_LEAK_RATE
}

impl LimiterConfig {
    /// Check the parameters the selected algorithm consumes.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::FixedWindow
            | Algorithm::SlidingWindowLog
            | Algorithm::SlidingWindowCounter => {
                require_positive("limit", self.limit)?;
                require_positive("window_ms", self.window_ms)?;
            }
            Algorithm::TokenBucket => {
                require_positive("capacity", self.capacity)?;
                require_positive_rate("refill_rate_per_second", self.refill_rate_per_second)?;
            }
            Algorithm::LeakyBucket => {
                require_positive("capacity", self.capacity)?;
                require_leak_rate(self.leak_rate_per_second)?;
            }
        }
        Ok(())
    }
}

/// Builds limiter instances from a configuration validated up front.
///
/// Once a factory exists, creating an instance cannot fail.
#[derive(Debug, Clone)]
pub struct LimiterFactory {
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    blueprint: Blueprint,
}

/// Validated parameters for one algorithm.
#[derive(Debug, Clone)]
enum Blueprint {
    FixedWindow { limit: u64, window_ms: u64 },
    SlidingWindowLog { limit: u64, window_ms: u64 },
    SlidingWindowCounter { limit: u64, window_ms: u64 },
    TokenBucket { capacity: u64, refill_rate: f64 },
    LeakyBucket { capacity: u64, leak_rate: u32, runtime: Handle },
}

impl LimiterFactory {
    /// Validate `config` and capture what instances will need.
    ///
    /// Leaky bucket factories must be created inside a Tokio runtime; the
    /// drain tasks of every instance are spawned onto that runtime.
    pub fn new(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let (limit, window_ms) = (config.limit, config.window_ms);
        let blueprint = match config.algorithm {
            Algorithm::FixedWindow => Blueprint::FixedWindow { limit, window_ms },
            Algorithm::SlidingWindowLog => Blueprint::SlidingWindowLog { limit, window_ms },
            Algorithm::SlidingWindowCounter => Blueprint::SlidingWindowCounter { limit, window_ms },
            Algorithm::TokenBucket => Blueprint::TokenBucket {
                capacity: config.capacity,
                refill_rate: config.refill_rate_per_second,
            },
            Algorithm::LeakyBucket => Blueprint::LeakyBucket {
                capacity: config.capacity,
                leak_rate: config.leak_rate_per_second,
                runtime: Handle::try_current().map_err(|_| TurnstileError::NoRuntime)?,
            },
        };

        Ok(Self {
            config,
            clock,
            blueprint,
        })
    }

    /// The configuration instances are built from.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Create a fresh limiter instance.
    pub fn create(&self) -> Arc<dyn RateLimiter> {
        let clock = self.clock.clone();

        debug!(
            algorithm = %self.config.algorithm,
            "Creating new limiter instance"
        );

        match &self.blueprint {
            Blueprint::FixedWindow { limit, window_ms } => {
                Arc::new(FixedWindowCounter::build(*limit, *window_ms, clock))
            }
            Blueprint::SlidingWindowLog { limit, window_ms } => {
                Arc::new(SlidingWindowLog::build(*limit, *window_ms, clock))
            }
            Blueprint::SlidingWindowCounter { limit, window_ms } => {
                Arc::new(SlidingWindowCounter::build(*limit, *window_ms, clock))
            }
            Blueprint::TokenBucket {
                capacity,
                refill_rate,
            } => Arc::new(TokenBucket::build(*capacity, *refill_rate, clock)),
            Blueprint::LeakyBucket {
                capacity,
                leak_rate,
                runtime,
            } => Arc::new(LeakyBucket::build(*capacity, *leak_rate, clock, runtime)),
        }
    }
}

pub(crate) fn require_positive(name: &'static str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(TurnstileError::invalid(name, "must be greater than 0"));
    }
    Ok(())
}

pub(crate) fn require_positive_rate(name: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(TurnstileError::invalid(
            name,
            format!("must be a finite number greater than 0, got {}", value),
        ));
    }
    Ok(())
}

pub(crate) fn require_leak_rate(rate: u32) -> Result<()> {
    if rate == 0 {
        return Err(TurnstileError::invalid("leak_rate_per_second", "must be greater than 0"));
    }
    if rate > MAX_LEAK_RATE_PER_SECOND {
        return Err(TurnstileError::invalid(
            "leak_rate_per_second",
            format!("must be at most {}, got {}", MAX_LEAK_RATE_PER_SECOND, rate),
        ));
    }
    Ok(())
}

/// Convert a window to whole milliseconds, rejecting anything shorter than 1ms.
pub(crate) fn duration_millis(name: &'static str, duration: Duration) -> Result<u64> {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Err(TurnstileError::invalid(name, "must be at least 1ms"));
    }
    Ok(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn config(algorithm: Algorithm) -> LimiterConfig {
        LimiterConfig {
            algorithm,
            ..LimiterConfig::default()
        }
    }

    #[test]
    fn test_validate_only_checks_used_fields() {
        let mut cfg = config(Algorithm::TokenBucket);
        cfg.limit = 0;
        cfg.window_ms = 0;
        assert!(cfg.validate().is_ok());

        let mut cfg = config(Algorithm::FixedWindow);
        cfg.capacity = 0;
        cfg.refill_rate_per_second = -1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_positive() {
        let mut cfg = config(Algorithm::SlidingWindowLog);
        cfg.window_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config(Algorithm::TokenBucket);
        cfg.refill_rate_per_second = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = config(Algorithm::TokenBucket);
        cfg.refill_rate_per_second = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = config(Algorithm::LeakyBucket);
        cfg.leak_rate_per_second = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config(Algorithm::LeakyBucket);
        cfg.leak_rate_per_second = 1001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_invalid_parameter_names_field() {
        let mut cfg = config(Algorithm::SlidingWindowCounter);
        cfg.limit = 0;

        match cfg.validate() {
            Err(TurnstileError::InvalidParameter { name, .. }) => assert_eq!(name, "limit"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_factory_creates_requested_algorithm() {
        let clock = Arc::new(ManualClock::new(0));
        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindowLog,
            Algorithm::SlidingWindowCounter,
            Algorithm::TokenBucket,
        ] {
            let factory = LimiterFactory::new(config(algorithm), clock.clone()).unwrap();
            let limiter = factory.create();
            assert_eq!(limiter.algorithm(), algorithm);
            assert!(limiter.allow_request());
        }
    }

    #[test]
    fn test_leaky_factory_requires_runtime() {
        let clock = Arc::new(ManualClock::new(0));
        let result = LimiterFactory::new(config(Algorithm::LeakyBucket), clock);
        assert!(matches!(result, Err(TurnstileError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_leaky_factory_inside_runtime() {
        let clock = Arc::new(ManualClock::new(0));
        let factory = LimiterFactory::new(config(Algorithm::LeakyBucket), clock).unwrap();
        let limiter = factory.create();
        assert_eq!(limiter.algorithm(), Algorithm::LeakyBucket);
        assert!(limiter.allow_request());
        limiter.shutdown();
    }

    /// Same timestamps in, same decisions out.
    #[test]
    fn test_replay_is_deterministic() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut now = 0u64;
        let timestamps: Vec<u64> = (0..500)
            .map(|_| {
                now += rng.gen_range(0..120);
                now
            })
            .collect();

        let replay = |algorithm: Algorithm| -> Vec<bool> {
            let clock = Arc::new(ManualClock::new(0));
            let cfg = LimiterConfig {
                algorithm,
                limit: 5,
                capacity: 5,
                refill_rate_per_second: 3.0,
                ..LimiterConfig::default()
            };
            let limiter = LimiterFactory::new(cfg, clock.clone()).unwrap().create();
            timestamps
                .iter()
                .map(|&t| {
                    clock.set(t);
                    limiter.allow_request()
                })
                .collect()
        };

        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindowLog,
            Algorithm::SlidingWindowCounter,
            Algorithm::TokenBucket,
        ] {
            let first = replay(algorithm);
            assert_eq!(first, replay(algorithm), "{} diverged on replay", algorithm);
            assert!(first.contains(&true) && first.contains(&false));
        }
    }

    #[test]
    fn test_algorithm_from_yaml() {
        let algorithm: Algorithm = serde_yaml::from_str("sliding_window_counter").unwrap();
        assert_eq!(algorithm, Algorithm::SlidingWindowCounter);
        assert_eq!(algorithm.to_string(), "sliding_window_counter");
    }
}
