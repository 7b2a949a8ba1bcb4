//! Background sender: drives all communication with the backend.
//!
//! The [`Sender`] owns one worker thread running a small state machine:
//!
//! ```text
//!           STATUS ok, capture on
//!   Initial ──────────────────────► Capturing ◄──────────┐
//!      │                                │                │ capture
//!      │ STATUS ok,                     │ capture        │ re-enabled
//!      │ capture off                    ▼ disabled       │
//!      └──────────────────────────► CaptureOff ──────────┘
//!
//!   any state ── shutdown ──► Terminal (best-effort final flush)
//! ```
//!
//! In `Initial` the sender probes STATUS until a usable response arrives;
//! the transport-failure sentinel never counts as a response and is retried
//! with increasing delays. Host threads can block on [`Sender::wait_for_init`]
//! until that resolution.
//!
//! In `Capturing`, every cycle announces unconfigured sessions with a
//! NEW_SESSION request, flushes finished sessions (then unregisters them and
//! drops their cache slot), and flushes pending chunks of every open session
//! whose configuration allows sending. Configurations carried by 200
//! responses are merged into the owning session.
//!
//! In `CaptureOff`, finished sessions are discarded without network calls
//! and a periodic STATUS probe watches for capture being re-enabled.
//!
//! # Invariants
//!
//! - The open and finished session sets are disjoint and guarded by one
//!   lock; a session moves between them exactly once.
//! - An erroneous beacon response disables capture for that session only;
//!   data still buffered in the cache is preserved.
//! - Shutdown is idempotent and bounded: the worker wakes immediately,
//!   performs one best-effort flush pass, and exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ConfigurationSlot, ServerConfiguration};
use crate::protocol::{parse_response, ResponseAttributes};
use crate::session::Session;
use crate::transport::BeaconTransport;

/// Increasing delays between STATUS retries while initializing.
const INIT_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// NEW_SESSION announcements attempted per session before giving up and
/// configuring it with capture disabled.
const MAX_ANNOUNCE_ATTEMPTS: u32 = 4;

/// Cycle wait when the configured send interval is not positive.
const DEFAULT_CYCLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Capturing,
    CaptureOff,
    Terminal,
}

struct SessionEntry {
    session: Arc<Session>,
    announce_attempts_left: u32,
}

#[derive(Default)]
struct SessionRegistry {
    open: Vec<SessionEntry>,
    finished: Vec<SessionEntry>,
}

impl SessionRegistry {
    /// Moves open sessions that were ended elsewhere (watchdog, controller)
    /// into the finished set.
    fn sweep(&mut self) {
        let mut index = 0;
        while index < self.open.len() {
            if self.open[index].session.is_finished() {
                let entry = self.open.swap_remove(index);
                self.finished.push(entry);
            } else {
                index += 1;
            }
        }
    }

    fn decrement_attempts(&mut self, session: &Arc<Session>) -> Option<u32> {
        self.open
            .iter_mut()
            .chain(self.finished.iter_mut())
            .find(|entry| Arc::ptr_eq(&entry.session, session))
            .map(|entry| {
                entry.announce_attempts_left = entry.announce_attempts_left.saturating_sub(1);
                entry.announce_attempts_left
            })
    }

    fn remove_finished(&mut self, session: &Arc<Session>) {
        self.finished
            .retain(|entry| !Arc::ptr_eq(&entry.session, session));
    }
}

/// One-shot completion flag for initialization.
struct InitSignal {
    resolved: Mutex<Option<bool>>,
    changed: Condvar,
}

impl InitSignal {
    fn new() -> Self {
        Self {
            resolved: Mutex::new(None),
            changed: Condvar::new(),
        }
    }

    fn resolve(&self, success: bool) {
        let mut resolved = self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if resolved.is_none() {
            *resolved = Some(success);
        }
        drop(resolved);
        self.changed.notify_all();
    }

    fn wait(&self) -> bool {
        let mut resolved = self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while resolved.is_none() {
            resolved = self
                .changed
                .wait(resolved)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        resolved.unwrap_or(false)
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut resolved = self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while resolved.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(resolved, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            resolved = guard;
        }
        resolved.unwrap_or(false)
    }

    fn peek(&self) -> Option<bool> {
        *self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct Shared {
    transport: Arc<dyn BeaconTransport>,
    registry: Mutex<SessionRegistry>,
    // Set by wake() and consumed by sleep(); a wake arriving while the
    // worker is mid-cycle shortens the following sleep instead of being
    // lost.
    wake_pending: Mutex<bool>,
    woken: Condvar,
    init: InitSignal,
    // Latest configuration obtained from any 200 response; drives the
    // process-level capture flag and the server id for probes.
    last_config: ConfigurationSlot,
    shutdown: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        let mut pending = self
            .wake_pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *pending = true;
        drop(pending);
        self.woken.notify_all();
    }

    /// Sleeps until the timeout elapses or `wake` is called.
    fn sleep(&self, timeout: Duration) {
        let pending = self
            .wake_pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut pending = self
            .woken
            .wait_timeout_while(pending, timeout, |pending| {
                !*pending && !self.shutdown.load(Ordering::SeqCst)
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .0;
        *pending = false;
    }

    /// Wait between cycles, derived from the configured send interval.
    fn cycle_wait(&self) -> Duration {
        let interval_ms = self.last_config.get().send_interval_ms;
        if interval_ms > 0 {
            Duration::from_millis(interval_ms as u64)
        } else {
            DEFAULT_CYCLE_WAIT
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn run(&self) {
        let mut state = self.initial_state();
        loop {
            if self.is_shut_down() {
                state = SendState::Terminal;
            }
            state = match state {
                SendState::Capturing => self.capturing_cycle(),
                SendState::CaptureOff => self.capture_off_cycle(),
                SendState::Terminal => {
                    self.terminal_flush();
                    return;
                }
            };
        }
    }

    /// Probes STATUS until a usable response resolves initialization.
    fn initial_state(&self) -> SendState {
        let mut attempt = 0usize;
        loop {
            if self.is_shut_down() {
                self.init.resolve(false);
                return SendState::Terminal;
            }
            let server_id = self.last_config.get().server_id;
            let response = self.transport.send_status_request(server_id);
            if response.is_ok() {
                let config = configuration_from(&response.body);
                self.last_config.set(config);
                self.init.resolve(true);
                info!(
                    server_id = config.server_id,
                    capture = config.capture_enabled,
                    "sender initialized"
                );
                return if config.capture_enabled {
                    SendState::Capturing
                } else {
                    SendState::CaptureOff
                };
            }
            debug!(code = response.code, "status probe failed, retrying");
            let delay = INIT_RETRY_DELAYS[attempt.min(INIT_RETRY_DELAYS.len() - 1)];
            attempt += 1;
            self.sleep(delay);
        }
    }

    fn capturing_cycle(&self) -> SendState {
        let (finished, open) = self.snapshot();
        // Announce first: a session that ended before it was ever
        // configured still needs its configuration to be transmittable.
        for session in finished.iter().chain(open.iter()) {
            if !session.is_configured() {
                self.announce_session(session);
            }
        }
        for session in &finished {
            if session.is_configured() {
                self.flush_session(session, true);
                let mut registry = self
                    .registry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                registry.remove_finished(session);
            }
        }
        for session in &open {
            if session.is_data_sending_allowed() {
                self.flush_session(session, false);
            }
        }
        if self.is_shut_down() {
            return SendState::Terminal;
        }
        if !self.last_config.get().capture_enabled {
            info!("capture disabled by server, pausing transmission");
            return SendState::CaptureOff;
        }
        self.sleep(self.cycle_wait());
        SendState::Capturing
    }

    fn capture_off_cycle(&self) -> SendState {
        // Finished sessions cannot be transmitted while capture is off;
        // discard their buffered data.
        let finished = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.sweep();
            std::mem::take(&mut registry.finished)
        };
        for entry in finished {
            entry.session.encoder().clear();
        }
        let server_id = self.last_config.get().server_id;
        let response = self.transport.send_status_request(server_id);
        if response.is_ok() {
            let config = configuration_from(&response.body);
            self.last_config.set(config);
            if config.capture_enabled {
                info!("capture re-enabled by server, resuming transmission");
                return SendState::Capturing;
            }
        }
        if self.is_shut_down() {
            return SendState::Terminal;
        }
        self.sleep(self.cycle_wait());
        SendState::CaptureOff
    }

    /// Ends every remaining session and flushes each one best-effort.
    fn terminal_flush(&self) {
        // Resolves to failure when shutdown arrived during initialization;
        // a no-op otherwise.
        self.init.resolve(false);
        let drained = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.sweep();
            let mut entries = std::mem::take(&mut registry.open);
            entries.append(&mut registry.finished);
            entries
                .into_iter()
                .map(|entry| entry.session)
                .collect::<Vec<_>>()
        };
        debug!(sessions = drained.len(), "final flush");
        for session in drained {
            if !session.is_configured() {
                self.announce_session(&session);
            }
            session.end();
            self.flush_session(&session, true);
        }
    }

    /// Snapshots both session sets without holding the lock during network
    /// calls.
    fn snapshot(&self) -> (Vec<Arc<Session>>, Vec<Arc<Session>>) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.sweep();
        let finished = registry
            .finished
            .iter()
            .map(|entry| Arc::clone(&entry.session))
            .collect();
        let open = registry
            .open
            .iter()
            .map(|entry| Arc::clone(&entry.session))
            .collect();
        (finished, open)
    }

    /// Sends a NEW_SESSION announcement for a not-yet-configured session.
    fn announce_session(&self, session: &Arc<Session>) {
        let server_id = self.last_config.get().server_id;
        let response = self.transport.send_new_session_request(server_id);
        if response.is_ok() {
            let config = configuration_from(&response.body);
            session.update_server_configuration(&config);
            self.last_config.set(config);
            debug!(key = %session.key(), "session configured");
            return;
        }
        if response.is_transport_failure() {
            // Leave unconfigured; the next cycle retries.
            return;
        }
        // A real HTTP error consumes one attempt; once exhausted the
        // session is configured with capture disabled so it stops asking.
        let attempts_left = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.decrement_attempts(session)
        };
        if attempts_left == Some(0) {
            warn!(key = %session.key(), "session announcement kept failing, disabling capture");
            let mut config =
                ServerConfiguration::from_attributes(&ResponseAttributes::undefined());
            config.capture_enabled = false;
            session.update_server_configuration(&config);
        }
    }

    /// Sends pending chunks of one session. With `finishing` set, the
    /// session's cache slot is dropped afterwards.
    fn flush_session(&self, session: &Arc<Session>, finishing: bool) {
        loop {
            if !session.is_data_sending_allowed() {
                break;
            }
            let Some(chunk) = session.encoder().next_chunk() else {
                break;
            };
            let server_id = session.server_configuration().server_id;
            let response = self.transport.send_beacon(server_id, &chunk);
            if response.is_ok() {
                let config = configuration_from(&response.body);
                session.update_server_configuration(&config);
                self.last_config.set(config);
            } else {
                // The extracted chunk is gone; data still in the cache is
                // preserved for a later attempt.
                debug!(key = %session.key(), code = response.code, "beacon rejected, disabling capture");
                session.disable_capture();
                break;
            }
        }
        if finishing {
            session.encoder().clear();
        }
    }
}

/// Turns a 200 response body into a configuration, falling back to the
/// default profile of the body's grammar when it does not parse.
fn configuration_from(body: &str) -> ServerConfiguration {
    match parse_response(body) {
        Ok(attributes) => ServerConfiguration::from_attributes(&attributes),
        Err(error) => {
            warn!(%error, "unparseable response body, using defaults");
            let defaults = if body.trim_start().starts_with('{') {
                ResponseAttributes::json_defaults()
            } else {
                ResponseAttributes::key_value_defaults()
            };
            ServerConfiguration::from_attributes(&defaults)
        }
    }
}

/// Owns the sender worker thread and the session registry.
pub struct Sender {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    /// Creates the sender and spawns its worker thread, which immediately
    /// starts probing the backend.
    #[must_use]
    pub fn new(transport: Arc<dyn BeaconTransport>) -> Self {
        let shared = Arc::new(Shared {
            transport,
            registry: Mutex::new(SessionRegistry::default()),
            wake_pending: Mutex::new(false),
            woken: Condvar::new(),
            init: InitSignal::new(),
            last_config: ConfigurationSlot::default(),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = match std::thread::Builder::new()
            .name("rum-beacon-sender".to_string())
            .spawn(move || thread_shared.run())
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(%error, "failed to spawn sender thread");
                shared.init.resolve(false);
                None
            }
        };
        Self {
            shared,
            handle: Mutex::new(handle),
        }
    }

    /// Registers a session with the open set. The worker wakes to announce
    /// it promptly.
    pub fn add_session(&self, session: Arc<Session>) {
        let mut registry = self
            .shared
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.open.push(SessionEntry {
            session,
            announce_attempts_left: MAX_ANNOUNCE_ATTEMPTS,
        });
        drop(registry);
        self.shared.wake();
    }

    /// Ends the session and moves it to the finished set; its remaining
    /// data is flushed and its cache slot dropped on the next cycle.
    pub fn finish_session(&self, session: &Arc<Session>) {
        session.end();
        let mut registry = self
            .shared
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let position = registry
            .open
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.session, session));
        if let Some(position) = position {
            let entry = registry.open.swap_remove(position);
            registry.finished.push(entry);
        }
        drop(registry);
        self.shared.wake();
    }

    /// Blocks until initialization resolves; returns whether it succeeded.
    #[must_use]
    pub fn wait_for_init(&self) -> bool {
        self.shared.init.wait()
    }

    /// Blocks until initialization resolves or the timeout elapses; returns
    /// `false` on timeout or failed initialization.
    #[must_use]
    pub fn wait_for_init_timeout(&self, timeout: Duration) -> bool {
        self.shared.init.wait_timeout(timeout)
    }

    /// Whether initialization has already resolved successfully.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.shared.init.peek() == Some(true)
    }

    /// The latest server configuration obtained from the backend.
    #[must_use]
    pub fn last_server_configuration(&self) -> Arc<ServerConfiguration> {
        self.shared.last_config.get()
    }

    /// Stops the worker after one best-effort final flush. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::session::testing::test_session;
    use crate::transport::testing::MockTransport;
    use crate::transport::TRANSPORT_FAILURE_CODE;

    const CAPTURE_ON: &str = "type=m&cp=1&si=1&bl=30&id=7";
    const CAPTURE_OFF: &str = "type=m&cp=0&si=1&id=7";

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    fn request_kinds(transport: &MockTransport) -> Vec<String> {
        transport
            .recorded_requests()
            .iter()
            .map(|line| line.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_init_resolves_on_status_response() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, CAPTURE_ON);
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);

        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));
        assert!(sender.is_initialized());
        assert_eq!(sender.last_server_configuration().server_id, 7);
        assert_eq!(
            transport.recorded_requests()[0],
            "STATUS srvid=-1",
            "first probe goes out with the default server id"
        );
        sender.shutdown();
    }

    #[test]
    fn test_init_retries_after_transport_sentinel() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(TRANSPORT_FAILURE_CODE, "");
        transport.push_response(200, CAPTURE_ON);
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);

        assert!(
            sender.wait_for_init_timeout(Duration::from_secs(5)),
            "sentinel must not resolve initialization"
        );
        assert!(transport.recorded_requests().len() >= 2);
        sender.shutdown();
    }

    #[test]
    fn test_shutdown_during_init_resolves_false() {
        let transport = Arc::new(MockTransport::new());
        // Queue nothing: every probe yields the sentinel.
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);
        sender.shutdown();
        assert!(!sender.wait_for_init());
        assert!(!sender.is_initialized());
    }

    #[test]
    fn test_session_announced_and_flushed_on_finish() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, CAPTURE_ON);
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);
        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));

        let (session, _, _) = test_session();
        sender.add_session(Arc::clone(&session));
        assert!(
            wait_until(Duration::from_secs(2), || session.is_configured()),
            "session was never announced"
        );
        assert!(request_kinds(&transport).contains(&"NEW_SESSION".to_string()));

        session.encoder().report_event(0, "click");
        sender.finish_session(&session);
        assert!(
            wait_until(Duration::from_secs(2), || session.encoder().is_empty()),
            "finished session was not flushed"
        );
        let beacons: Vec<String> = transport
            .recorded_requests()
            .into_iter()
            .filter(|line| line.starts_with("BEACON"))
            .collect();
        assert!(!beacons.is_empty());
        assert!(beacons.iter().any(|line| line.contains("et=19")));
        sender.shutdown();
    }

    #[test]
    fn test_capture_off_discards_without_sending() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, CAPTURE_OFF);
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);
        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));

        let (session, _, _) = test_session();
        sender.add_session(Arc::clone(&session));
        sender.finish_session(&session);
        assert!(
            wait_until(Duration::from_secs(3), || session.encoder().is_empty()),
            "finished session data must be discarded while capture is off"
        );
        let kinds = request_kinds(&transport);
        assert!(!kinds.contains(&"BEACON".to_string()));
        assert!(!kinds.contains(&"NEW_SESSION".to_string()));
        sender.shutdown();
    }

    #[test]
    fn test_capture_off_resumes_on_reenable() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, CAPTURE_OFF);
        transport.push_response(200, CAPTURE_ON);
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);
        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));

        // The second STATUS probe re-enables capture; afterwards a new
        // session gets announced again.
        let (session, _, _) = test_session();
        sender.add_session(Arc::clone(&session));
        assert!(
            wait_until(Duration::from_secs(5), || session.is_configured()),
            "capture was never resumed"
        );
        sender.shutdown();
    }

    #[test]
    fn test_erroneous_beacon_disables_session_capture() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, CAPTURE_ON); // STATUS
        transport.push_response(200, CAPTURE_ON); // NEW_SESSION
        transport.push_response(400, ""); // BEACON
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);
        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));

        let (session, _, _) = test_session();
        sender.add_session(Arc::clone(&session));
        assert!(wait_until(Duration::from_secs(2), || session.is_configured()));
        assert!(
            wait_until(Duration::from_secs(3), || !session
                .is_data_sending_allowed()),
            "rejected beacon must disable capture for the session"
        );
        assert!(!session.is_finished());
        sender.shutdown();
    }

    #[test]
    fn test_shutdown_performs_final_flush() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, CAPTURE_ON);
        let sender = Sender::new(Arc::clone(&transport) as Arc<dyn BeaconTransport>);
        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));

        let (session, _, _) = test_session();
        sender.add_session(Arc::clone(&session));
        assert!(wait_until(Duration::from_secs(2), || session.is_configured()));

        session.encoder().identify_user("user-1");
        sender.shutdown();
        assert!(session.is_finished(), "shutdown ends open sessions");
        assert!(session.encoder().is_empty(), "shutdown flushes open sessions");
        let beacons: Vec<String> = transport
            .recorded_requests()
            .into_iter()
            .filter(|line| line.starts_with("BEACON"))
            .collect();
        assert!(beacons.iter().any(|line| line.contains("et=60")));
    }
}
