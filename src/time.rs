//! Time sources for the agent.
//!
//! All pipeline components take their notion of "now" from the [`Clock`]
//! trait rather than calling `SystemTime::now()` directly. Production code
//! uses [`SystemClock`]; tests substitute a fake clock so that eviction ages,
//! split thresholds, and watchdog deadlines are deterministic.
//!
//! Timestamps are Unix epoch milliseconds carried as `i64`, matching the
//! wire format's time offsets.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock timestamps in epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        // A clock before 1970 degrades to 0 rather than panicking; the
        // pipeline treats timestamps as opaque offsets.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::Clock;

    /// Manually advanced clock for deterministic tests.
    #[derive(Debug, Default)]
    pub struct FakeClock {
        now_ms: AtomicI64,
    }

    impl FakeClock {
        pub fn new(start_ms: i64) -> Self {
            Self {
                now_ms: AtomicI64::new(start_ms),
            }
        }

        pub fn advance(&self, delta_ms: i64) {
            self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        }

        pub fn set(&self, now_ms: i64) {
            self.now_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> i64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }
}
