//! Per-key limiter registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::limiter::{LimiterConfig, LimiterFactory, RateLimiter};
use crate::config::RegistryConfig;
use crate::error::{Result, TurnstileError};

/// Maps admission keys to their own limiter instance.
///
/// Instances are created on first use and reused afterwards; the lookup and
/// creation happen under the same map shard lock, so concurrent first use of
/// a key still produces exactly one instance. Keys that have not been used
/// for a while can be evicted with [`evict_idle`](Self::evict_idle), which
/// also stops any background work the instance owns.
///
/// The map is sharded, so work on one key never waits behind a lock held for
/// all keys.
#[derive(Debug)]
pub struct LimiterRegistry {
    /// Limiter entries indexed by admission key
    entries: DashMap<String, RegistryEntry>,
    factory: LimiterFactory,
    clock: Arc<dyn Clock>,
    default_key: String,
    retention: Duration,
    eviction_interval: Duration,
}

#[derive(Debug)]
struct RegistryEntry {
    limiter: Arc<dyn RateLimiter>,
    last_access: AtomicU64,
}

impl RegistryEntry {
    fn new(limiter: Arc<dyn RateLimiter>, now: u64) -> Self {
        Self {
            limiter,
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

impl LimiterRegistry {
    /// Create a registry on the system clock.
    pub fn new(limiter: LimiterConfig, registry: &RegistryConfig) -> Result<Self> {
        Self::with_clock(limiter, registry, Arc::new(SystemClock))
    }

    /// Create a registry whose limiters and idle tracking read `clock`.
    ///
    /// Both configurations are validated here; nothing is validated per request.
    pub fn with_clock(
        limiter: LimiterConfig,
        registry: &RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        registry.validate()?;
        let factory = LimiterFactory::new(limiter, clock.clone())?;

        info!(
            algorithm = %factory.config().algorithm,
            default_key = %registry.default_key,
            retention_secs = registry.retention_secs,
            "Limiter registry initialized"
        );

        Ok(Self {
            entries: DashMap::new(),
            factory,
            clock,
            default_key: registry.default_key.clone(),
            retention: registry.retention(),
            eviction_interval: registry.eviction_interval(),
        })
    }

    /// Get the limiter for `key`, creating it if this is the key's first use.
    ///
    /// Blank keys share the default key's limiter.
    pub fn resolve(&self, key: &str) -> Arc<dyn RateLimiter> {
        let key = self.normalize(key);
        let now = self.clock.now_millis();

        if let Some(entry) = self.entries.get(key) {
            entry.touch(now);
            return entry.limiter.clone();
        }

        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating limiter for new key");
            RegistryEntry::new(self.factory.create(), now)
        });
        entry.touch(now);
        entry.limiter.clone()
    }

    /// Resolve `key` and decide one request against its limiter.
    pub fn check(&self, key: &str) -> bool {
        let allowed = self.resolve(key).allow_request();
        if allowed {
            trace!(key = %key, "Request admitted");
        } else {
            debug!(key = %key, "Rate limit exceeded");
        }
        allowed
    }

    /// Remove every entry not used within `older_than`, stopping its limiter.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_idle(&self, older_than: Duration) -> usize {
        let older_than = u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX);
        let threshold = self.clock.now_millis().saturating_sub(older_than);

        let mut evicted = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.last_access() < threshold {
                evicted.push((key.clone(), entry.limiter.clone()));
                false
            } else {
                true
            }
        });

        for (key, limiter) in &evicted {
            limiter.shutdown();
            debug!(key = %key, "Evicted idle limiter");
        }

        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                remaining = self.entries.len(),
                "Evicted idle limiters"
            );
        }
        evicted.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) with the configured retention on
    /// the configured interval.
    ///
    /// The task holds only a weak reference, so it ends on its own once the
    /// registry is dropped.
    pub fn spawn_eviction(self: &Arc<Self>) -> Result<EvictionTask> {
        let runtime = Handle::try_current().map_err(|_| TurnstileError::NoRuntime)?;
        let weak = Arc::downgrade(self);
        let (period, retention) = (self.eviction_interval, self.retention);

        let handle = runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.evict_idle(retention);
            }
        });

        debug!(
            interval_secs = period.as_secs(),
            retention_secs = retention.as_secs(),
            "Started idle eviction"
        );
        Ok(EvictionTask {
            handle: Some(handle),
        })
    }

    /// Remove and stop every limiter.
    pub fn shutdown(&self) {
        let mut removed = Vec::new();
        self.entries.retain(|_, entry| {
            removed.push(entry.limiter.clone());
            false
        });

        for limiter in &removed {
            limiter.shutdown();
        }
        info!(removed = removed.len(), "Limiter registry shut down");
    }

    /// Whether a limiter currently exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(self.normalize(key))
    }

    /// Number of live limiters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no limiter exists yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key used for blank or unresolvable identities.
    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    fn normalize<'a>(&'a self, key: &'a str) -> &'a str {
        if key.trim().is_empty() {
            &self.default_key
        } else {
            key
        }
    }
}

/// Handle to the periodic eviction task. Dropping it stops the task.
#[derive(Debug)]
pub struct EvictionTask {
    handle: Option<JoinHandle<()>>,
}

impl EvictionTask {
    /// Stop the task.
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Stopped idle eviction");
        }
    }
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, ManualClock};
    use std::sync::Barrier;
    use std::thread;

    fn limiter_config(algorithm: Algorithm, limit: u64) -> LimiterConfig {
        LimiterConfig {
            algorithm,
            limit,
            capacity: limit,
            ..LimiterConfig::default()
        }
    }

    fn registry(algorithm: Algorithm, limit: u64) -> (LimiterRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let registry = LimiterRegistry::with_clock(
            limiter_config(algorithm, limit),
            &RegistryConfig::default(),
            clock.clone(),
        )
        .unwrap();
        (registry, clock)
    }

    #[test]
    fn test_resolve_reuses_instance() {
        let (registry, _clock) = registry(Algorithm::FixedWindow, 5);

        let first = registry.resolve("alice");
        let second = registry.resolve("alice");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_keys_have_separate_budgets() {
        let (registry, _clock) = registry(Algorithm::FixedWindow, 2);

        assert!(registry.check("alice"));
        assert!(registry.check("alice"));
        assert!(!registry.check("alice"));

        assert!(registry.check("bob"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_blank_key_uses_default() {
        let (registry, _clock) = registry(Algorithm::TokenBucket, 1);

        let blank = registry.resolve("");
        let spaces = registry.resolve("   ");
        let anonymous = registry.resolve("anonymous");

        assert!(Arc::ptr_eq(&blank, &spaces));
        assert!(Arc::ptr_eq(&blank, &anonymous));
        assert!(registry.contains(""));
        assert_eq!(registry.default_key(), "anonymous");
    }

    #[test]
    fn test_concurrent_first_use_creates_one_instance() {
        const THREADS: usize = 16;
        let (registry, _clock) = registry(Algorithm::SlidingWindowLog, 10);
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.resolve("new-key")
                })
            })
            .collect();

        let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        for limiter in &limiters[1..] {
            assert!(Arc::ptr_eq(&limiters[0], limiter));
        }
    }

    #[test]
    fn test_concurrent_requests_respect_limit() {
        let (registry, _clock) = registry(Algorithm::FixedWindow, 100);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || (0..50).filter(|_| registry.check("shared")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }

    #[test]
    fn test_evict_idle_keeps_recent_keys() {
        let (registry, clock) = registry(Algorithm::FixedWindow, 5);

        registry.resolve("idle");
        clock.set(5_000);
        registry.resolve("active");

        clock.set(10_000);
        let evicted = registry.evict_idle(Duration::from_secs(8));

        assert_eq!(evicted, 1);
        assert!(!registry.contains("idle"));
        assert!(registry.contains("active"));
    }

    #[test]
    fn test_evicted_key_gets_fresh_limiter() {
        let (registry, clock) = registry(Algorithm::FixedWindow, 1);

        let before = registry.resolve("alice");
        assert!(before.allow_request());
        assert!(!registry.check("alice"));

        clock.set(60_000);
        assert_eq!(registry.evict_idle(Duration::from_secs(1)), 1);

        let after = registry.resolve("alice");
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.allow_request());
    }

    #[test]
    fn test_invalid_configuration_fails_at_construction() {
        let config = limiter_config(Algorithm::FixedWindow, 0);
        assert!(LimiterRegistry::new(config, &RegistryConfig::default()).is_err());

        let registry_config = RegistryConfig {
            retention_secs: 0,
            ..RegistryConfig::default()
        };
        let config = limiter_config(Algorithm::FixedWindow, 1);
        assert!(LimiterRegistry::new(config, &registry_config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_stops_leaky_drain() {
        let (registry, clock) = registry(Algorithm::LeakyBucket, 1);

        let limiter = registry.resolve("alice");
        assert!(limiter.allow_request());

        clock.set(60_000);
        assert_eq!(registry.evict_idle(Duration::from_secs(1)), 1);

        // A running drain would have freed the slot by now.
        time::sleep(Duration::from_secs(5)).await;
        assert!(!limiter.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_eviction() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RegistryConfig {
            retention_secs: 30,
            eviction_interval_secs: 10,
            ..RegistryConfig::default()
        };
        let registry = Arc::new(
            LimiterRegistry::with_clock(
                limiter_config(Algorithm::TokenBucket, 5),
                &config,
                clock.clone(),
            )
            .unwrap(),
        );
        let task = registry.spawn_eviction().unwrap();

        registry.resolve("alice");
        clock.set(45_000);
        registry.resolve("bob");

        time::sleep(Duration::from_secs(11)).await;
        assert!(!registry.contains("alice"));
        assert!(registry.contains("bob"));

        task.stop();
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything() {
        let (registry, _clock) = registry(Algorithm::LeakyBucket, 3);
        registry.resolve("a");
        registry.resolve("b");

        registry.shutdown();
        assert!(registry.is_empty());
    }
}
