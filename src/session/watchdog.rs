//! Deferred closing of superseded session instances.
//!
//! When a logical session splits, the old instance stays open for a grace
//! period so that in-flight actions can still complete against it. The
//! [`SessionWatchdog`] owns that bookkeeping: a background thread sleeps
//! until the nearest deadline, closes every expired entry, and goes back to
//! sleep.
//!
//! # Invariants
//!
//! - An entry's deadline never changes after enqueueing.
//! - A non-positive grace period closes the session synchronously on the
//!   caller's thread; nothing is enqueued.
//! - `shutdown` closes every still-pending entry before the thread exits,
//!   so no session instance leaks an unsent SESSION_END marker.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::Session;
use crate::time::Clock;

/// Sleep bound when no entry is pending.
const IDLE_WAIT: Duration = Duration::from_secs(5);

struct PendingClose {
    session: Arc<Session>,
    deadline_ms: i64,
}

#[derive(Default)]
struct WatchdogState {
    pending: Vec<PendingClose>,
    shutdown: bool,
}

struct Shared {
    clock: Arc<dyn Clock>,
    state: Mutex<WatchdogState>,
    changed: Condvar,
}

/// Closes superseded session instances after their grace period.
pub struct SessionWatchdog {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWatchdog {
    /// Creates the watchdog and spawns its background thread.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared {
            clock,
            state: Mutex::new(WatchdogState::default()),
            changed: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = match std::thread::Builder::new()
            .name("rum-session-watchdog".to_string())
            .spawn(move || thread_shared.run())
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(%error, "failed to spawn session watchdog thread");
                None
            }
        };
        Self {
            shared,
            handle: Mutex::new(handle),
        }
    }

    /// Closes the session now when `grace_ms` is non-positive, otherwise
    /// enqueues it for closing once the grace period elapses.
    pub fn close_or_enqueue_for_closing(&self, session: Arc<Session>, grace_ms: i64) {
        if grace_ms <= 0 {
            session.end();
            return;
        }
        let deadline_ms = self.shared.clock.now_ms() + grace_ms;
        debug!(key = %session.key(), grace_ms, "session enqueued for deferred close");
        let mut state = self.lock_state();
        state.pending.push(PendingClose {
            session,
            deadline_ms,
        });
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Removes a previously enqueued session without closing it. No-op when
    /// the session is not pending.
    pub fn dequeue_from_closing(&self, session: &Arc<Session>) {
        let mut state = self.lock_state();
        state
            .pending
            .retain(|entry| !Arc::ptr_eq(&entry.session, session));
    }

    /// Number of sessions currently awaiting deferred close.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Stops the background thread. Every still-pending session is closed
    /// immediately. Idempotent.
    pub fn shutdown(&self) {
        let remaining = {
            let mut state = self.lock_state();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        self.shared.changed.notify_all();
        for entry in remaining {
            entry.session.end();
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WatchdogState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for SessionWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        loop {
            let expired = {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if state.shutdown {
                    return;
                }
                let now = self.clock.now_ms();
                let wait = match state.pending.iter().map(|e| e.deadline_ms).min() {
                    Some(nearest) if nearest <= now => Duration::ZERO,
                    Some(nearest) => Duration::from_millis((nearest - now) as u64).min(IDLE_WAIT),
                    None => IDLE_WAIT,
                };
                if !wait.is_zero() {
                    let (guard, _) = self
                        .changed
                        .wait_timeout(state, wait)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state = guard;
                }
                if state.shutdown {
                    return;
                }
                let now = self.clock.now_ms();
                let mut expired = Vec::new();
                state.pending.retain_mut(|entry| {
                    if entry.deadline_ms <= now {
                        expired.push(Arc::clone(&entry.session));
                        false
                    } else {
                        true
                    }
                });
                expired
            };
            for session in expired {
                debug!(key = %session.key(), "grace period elapsed, closing session");
                session.end();
            }
        }
    }
}
