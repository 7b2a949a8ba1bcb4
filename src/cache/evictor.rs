//! Background enforcement of cache bounds.
//!
//! The [`CacheEvictor`] runs one daemon thread with two strategies:
//!
//! - **Space**: when the global size total exceeds the configured upper
//!   bound, remove globally-oldest records until the total is at or below
//!   the lower bound.
//! - **Age**: on a coarser period, remove records older than the configured
//!   maximum record age.
//!
//! The thread sleeps on the cache's change signal, so it reacts to append
//! bursts promptly without polling, and shutdown wakes it immediately.
//! Overflow is handled structurally here and never surfaces as an error to
//! the instrumented application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::EventCache;
use crate::config::AgentConfiguration;
use crate::time::Clock;

/// How long one evictor cycle sleeps when the cache is quiet.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Minimum spacing between age-eviction runs.
const AGE_RUN_INTERVAL_MS: i64 = 10_000;

/// Tuning for the evictor, derived from the agent configuration.
#[derive(Debug, Clone, Copy)]
pub struct EvictionBounds {
    /// Maximum record age in milliseconds; age eviction is disabled when
    /// not positive.
    pub max_record_age_ms: i64,
    /// Size at which space eviction starts.
    pub upper_bound_bytes: u64,
    /// Size space eviction shrinks down to.
    pub lower_bound_bytes: u64,
}

impl EvictionBounds {
    /// Extracts the eviction bounds from an agent configuration.
    #[must_use]
    pub const fn from_config(config: &AgentConfiguration) -> Self {
        Self {
            max_record_age_ms: config.max_record_age_ms,
            upper_bound_bytes: config.cache_size_upper_bound_bytes,
            lower_bound_bytes: config.cache_size_lower_bound_bytes,
        }
    }

    const fn age_eviction_enabled(&self) -> bool {
        self.max_record_age_ms > 0
    }

    const fn space_eviction_enabled(&self) -> bool {
        self.upper_bound_bytes > 0 && self.lower_bound_bytes > 0
    }
}

/// Background loop enforcing cache bounds against an [`EventCache`].
pub struct CacheEvictor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    cache: Arc<EventCache>,
    clock: Arc<dyn Clock>,
    bounds: EvictionBounds,
    shutdown: AtomicBool,
}

impl CacheEvictor {
    /// Creates an evictor; the background thread starts on
    /// [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(cache: Arc<EventCache>, clock: Arc<dyn Clock>, bounds: EvictionBounds) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                clock,
                bounds,
                shutdown: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Starts the background thread. A second call is a no-op.
    pub fn initialize(&mut self) {
        if self.handle.is_some() {
            return;
        }
        if !self.shared.bounds.age_eviction_enabled() {
            info!("cache age eviction disabled (no positive max record age)");
        }
        if !self.shared.bounds.space_eviction_enabled() {
            info!("cache space eviction disabled (no positive size bounds)");
        }
        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name("rum-cache-evictor".to_string())
            .spawn(move || shared.run())
        {
            Ok(handle) => self.handle = Some(handle),
            Err(error) => warn!(%error, "failed to spawn cache evictor thread"),
        }
    }

    /// Stops the background thread promptly. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cache.wake_waiters();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("cache evictor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CacheEvictor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        debug!("cache evictor started");
        let mut last_age_run_ms = self.clock.now_ms();
        while !self.shutdown.load(Ordering::SeqCst) {
            self.cache.wait_for_change(IDLE_WAIT);
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.run_space_eviction();
            last_age_run_ms = self.maybe_run_age_eviction(last_age_run_ms);
        }
        debug!("cache evictor stopped");
    }

    fn run_space_eviction(&self) {
        if !self.bounds.space_eviction_enabled() {
            return;
        }
        let total = self.cache.total_size();
        if total <= self.bounds.upper_bound_bytes {
            return;
        }
        let evicted = self.cache.evict_to_size(self.bounds.lower_bound_bytes);
        debug!(
            evicted,
            total_before = total,
            total_after = self.cache.total_size(),
            "space eviction ran"
        );
    }

    fn maybe_run_age_eviction(&self, last_run_ms: i64) -> i64 {
        if !self.bounds.age_eviction_enabled() {
            return last_run_ms;
        }
        let now = self.clock.now_ms();
        if now - last_run_ms < AGE_RUN_INTERVAL_MS {
            return last_run_ms;
        }
        let min_timestamp = now - self.bounds.max_record_age_ms;
        let evicted = self.cache.evict_older_than(min_timestamp);
        if evicted > 0 {
            debug!(evicted, min_timestamp, "age eviction ran");
        }
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RecordClass, SessionKey};
    use crate::time::testing::FakeClock;

    fn bounds(max_age_ms: i64, lower: u64, upper: u64) -> EvictionBounds {
        EvictionBounds {
            max_record_age_ms: max_age_ms,
            upper_bound_bytes: upper,
            lower_bound_bytes: lower,
        }
    }

    #[test]
    fn test_space_eviction_runs_only_above_upper_bound() {
        let cache = Arc::new(EventCache::new());
        let clock = Arc::new(FakeClock::new(0));
        let shared = Shared {
            cache: Arc::clone(&cache),
            clock,
            bounds: bounds(0, 4, 8),
            shutdown: AtomicBool::new(false),
        };
        let key = SessionKey::new(1);
        cache.append(key, RecordClass::Event, 1, "aaaa".to_string());
        shared.run_space_eviction();
        assert_eq!(cache.total_size(), 4);

        cache.append(key, RecordClass::Event, 2, "bbbb".to_string());
        cache.append(key, RecordClass::Event, 3, "cccc".to_string());
        shared.run_space_eviction();
        assert!(cache.total_size() <= 4);
    }

    #[test]
    fn test_age_eviction_uses_clock_and_interval() {
        let cache = Arc::new(EventCache::new());
        let clock = Arc::new(FakeClock::new(100_000));
        let shared = Shared {
            cache: Arc::clone(&cache),
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            bounds: bounds(50_000, 0, 0),
            shutdown: AtomicBool::new(false),
        };
        let key = SessionKey::new(1);
        cache.append(key, RecordClass::Event, 40_000, "old".to_string());
        cache.append(key, RecordClass::Event, 90_000, "new".to_string());

        // Not yet due: last run too recent.
        let last = shared.maybe_run_age_eviction(95_000);
        assert_eq!(last, 95_000);
        assert_eq!(cache.record_count(), 2);

        // Due: evicts everything older than now - max_age = 50_000.
        let last = shared.maybe_run_age_eviction(0);
        assert_eq!(last, 100_000);
        assert_eq!(cache.record_count(), 1);
    }

    #[test]
    fn test_disabled_strategies_do_nothing() {
        let cache = Arc::new(EventCache::new());
        let shared = Shared {
            cache: Arc::clone(&cache),
            clock: Arc::new(FakeClock::new(1_000_000)),
            bounds: bounds(0, 0, 0),
            shutdown: AtomicBool::new(false),
        };
        let key = SessionKey::new(1);
        cache.append(key, RecordClass::Event, 1, "x".to_string());
        shared.run_space_eviction();
        let last = shared.maybe_run_age_eviction(0);
        assert_eq!(last, 0);
        assert_eq!(cache.record_count(), 1);
    }

    #[test]
    fn test_lifecycle_is_idempotent_and_prompt() {
        let cache = Arc::new(EventCache::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let mut evictor = CacheEvictor::new(cache, clock, bounds(1_000, 10, 20));
        evictor.initialize();
        evictor.initialize();
        evictor.shutdown();
        evictor.shutdown();
    }
}
