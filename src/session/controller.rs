//! Top-level session API with transparent splitting.
//!
//! A [`SessionController`] represents one *logical* session to the host
//! application. Internally it delegates to a current [`Session`] instance
//! and replaces that instance transparently when the server-configured
//! event threshold is reached:
//!
//! ```text
//!   enter_action / identify_user / report_crash / trace_web_request
//!        │
//!        ▼ count += 1
//!   count % max_events == 0 ?
//!        │ yes
//!        ▼
//!   create next instance (sequence + 1), register with sender,
//!   hand the old instance to the watchdog with grace = duration / 2
//! ```
//!
//! # Invariants
//!
//! - Split thresholds come from the *first* server configuration this
//!   logical session receives and never change afterwards, so the split
//!   cadence is stable even when later responses carry different values.
//! - Only top-level operations count towards the split threshold; events
//!   reported through an [`Action`] handle do not.
//! - After [`SessionController::end`] every operation is a no-op handing
//!   back inert handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use super::watchdog::SessionWatchdog;
use super::{ServerConfigurationObserver, Session, SessionCreator};
use crate::beacon::{ActionEvent, WebRequestEvent};
use crate::config::ServerConfiguration;
use crate::sender::Sender;

struct ControllerState {
    current: Arc<Session>,
    top_level_event_count: i32,
    last_interaction_time_ms: i64,
    // First server configuration seen by this logical session; split
    // decisions use only this snapshot.
    split_config: Option<ServerConfiguration>,
    ended: bool,
}

struct Inner {
    creator: SessionCreator,
    sender: Arc<Sender>,
    watchdog: Arc<SessionWatchdog>,
    state: Mutex<ControllerState>,
    weak_self: Weak<Inner>,
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Records one top-level operation and splits the session when the
    /// frozen event threshold is hit.
    fn on_top_level_event(&self, state: &mut ControllerState) {
        state.top_level_event_count += 1;
        state.last_interaction_time_ms = state.current.encoder().current_timestamp_ms();
        let Some(split_config) = state.split_config else {
            return;
        };
        if !split_config.is_split_by_events_enabled() {
            return;
        }
        if state.top_level_event_count % split_config.max_events_per_session == 0 {
            self.split(state, &split_config);
        }
    }

    fn split(&self, state: &mut ControllerState, split_config: &ServerConfiguration) {
        let old = Arc::clone(&state.current);
        let new = self.creator.create();
        info!(old = %old.key(), new = %new.key(), "session split by event count");
        new.set_configuration_observer(
            self.weak_self.clone() as Weak<dyn ServerConfigurationObserver>
        );
        self.register(&new);
        state.current = new;
        state.top_level_event_count = 0;
        // Half the maximum session duration; in-flight actions on the old
        // instance get that long to complete.
        let grace_ms = i64::from(split_config.max_session_duration_ms) / 2;
        self.watchdog.close_or_enqueue_for_closing(old, grace_ms);
    }

    fn register(&self, session: &Arc<Session>) {
        self.sender.add_session(Arc::clone(session));
    }
}

impl ServerConfigurationObserver for Inner {
    fn on_server_configuration_update(&self, config: &ServerConfiguration) {
        let mut state = self.lock_state();
        if state.split_config.is_none() {
            debug!(
                max_events = config.max_events_per_session,
                max_duration_ms = config.max_session_duration_ms,
                "split thresholds frozen"
            );
            state.split_config = Some(*config);
        }
    }
}

/// One logical session as seen by the host application.
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Creates the logical session: builds its first instance, registers it
    /// with the sender and subscribes to configuration updates.
    #[must_use]
    pub fn new(
        creator: SessionCreator,
        sender: Arc<Sender>,
        watchdog: Arc<SessionWatchdog>,
    ) -> Self {
        let current = creator.create();
        let now = current.encoder().current_timestamp_ms();
        let inner = Arc::new_cyclic(|weak| Inner {
            creator,
            sender,
            watchdog,
            state: Mutex::new(ControllerState {
                current: Arc::clone(&current),
                top_level_event_count: 0,
                last_interaction_time_ms: now,
                split_config: None,
                ended: false,
            }),
            weak_self: weak.clone(),
        });
        current.set_configuration_observer(
            Arc::downgrade(&inner) as Weak<dyn ServerConfigurationObserver>
        );
        inner.register(&current);
        Self { inner }
    }

    /// Starts a top-level action. Returns an inert handle after `end`.
    #[must_use]
    pub fn enter_action(&self, name: &str) -> Action {
        let mut state = self.inner.lock_state();
        if state.ended {
            return Action::inert();
        }
        let action = Action::begin(Arc::clone(&state.current), name);
        self.inner.on_top_level_event(&mut state);
        action
    }

    /// Tags this session with a user identifier.
    pub fn identify_user(&self, user_tag: &str) {
        let mut state = self.inner.lock_state();
        if state.ended {
            return;
        }
        state.current.encoder().identify_user(user_tag);
        self.inner.on_top_level_event(&mut state);
    }

    /// Reports a crash on this session.
    pub fn report_crash(&self, name: &str, reason: &str) {
        let mut state = self.inner.lock_state();
        if state.ended {
            return;
        }
        state.current.encoder().report_crash(name, reason);
        self.inner.on_top_level_event(&mut state);
    }

    /// Starts tracing a web request outside any action. Returns an inert
    /// handle after `end`.
    #[must_use]
    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        let mut state = self.inner.lock_state();
        if state.ended {
            return WebRequestTracer::inert();
        }
        let tracer = WebRequestTracer::begin(Arc::clone(&state.current), url, 0);
        self.inner.on_top_level_event(&mut state);
        tracer
    }

    /// Ends the logical session. Idempotent; later operations are no-ops.
    pub fn end(&self) {
        let current = {
            let mut state = self.inner.lock_state();
            if state.ended {
                return;
            }
            state.ended = true;
            Arc::clone(&state.current)
        };
        // The current instance may itself be scheduled for deferred close
        // when splitting raced with ending.
        self.inner.watchdog.dequeue_from_closing(&current);
        self.inner.sender.finish_session(&current);
    }

    /// Key of the current underlying instance (changes on split).
    #[must_use]
    pub fn current_key(&self) -> crate::cache::SessionKey {
        self.inner.lock_state().current.key()
    }

    /// Timestamp of the last top-level interaction, epoch ms.
    #[must_use]
    pub fn last_interaction_time_ms(&self) -> i64 {
        self.inner.lock_state().last_interaction_time_ms
    }
}

/// Handle for an in-progress top-level action.
///
/// The action fragment is emitted when the handle is left; ids and sequence
/// numbers were drawn when it was entered, so the fragment lands on the
/// instance that was current at enter time even if the session split in
/// between.
pub struct Action {
    session: Option<Arc<Session>>,
    name: String,
    id: i32,
    start_sequence: i32,
    start_time_ms: i64,
    left: AtomicBool,
}

impl Action {
    fn begin(session: Arc<Session>, name: &str) -> Self {
        let encoder = session.encoder();
        let id = encoder.next_id();
        let start_sequence = encoder.next_sequence_number();
        let start_time_ms = encoder.current_timestamp_ms();
        Self {
            session: Some(session),
            name: name.to_string(),
            id,
            start_sequence,
            start_time_ms,
            left: AtomicBool::new(false),
        }
    }

    const fn inert() -> Self {
        Self {
            session: None,
            name: String::new(),
            id: 0,
            start_sequence: 0,
            start_time_ms: 0,
            left: AtomicBool::new(true),
        }
    }

    /// The action id, usable as `parent_action_id` for child events.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Reports a named event under this action.
    pub fn report_event(&self, name: &str) {
        if let Some(session) = self.active() {
            session.encoder().report_event(self.id, name);
        }
    }

    /// Reports a string value under this action.
    pub fn report_value_string(&self, name: &str, value: &str) {
        if let Some(session) = self.active() {
            session.encoder().report_value_string(self.id, name, value);
        }
    }

    /// Reports an integer value under this action.
    pub fn report_value_int(&self, name: &str, value: i64) {
        if let Some(session) = self.active() {
            session.encoder().report_value_int(self.id, name, value);
        }
    }

    /// Reports a floating-point value under this action.
    pub fn report_value_double(&self, name: &str, value: f64) {
        if let Some(session) = self.active() {
            session.encoder().report_value_double(self.id, name, value);
        }
    }

    /// Reports an error under this action.
    pub fn report_error(&self, name: &str, error_code: i32) {
        if let Some(session) = self.active() {
            session.encoder().report_error(self.id, name, error_code);
        }
    }

    /// Starts tracing a web request under this action.
    #[must_use]
    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        match self.active() {
            Some(session) => WebRequestTracer::begin(Arc::clone(session), url, self.id),
            None => WebRequestTracer::inert(),
        }
    }

    /// Finishes the action and emits its fragment. Idempotent.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        let encoder = session.encoder();
        let end_sequence = encoder.next_sequence_number();
        let end_time_ms = encoder.current_timestamp_ms();
        encoder.add_action(&ActionEvent {
            name: self.name.clone(),
            id: self.id,
            parent_id: 0,
            start_sequence: self.start_sequence,
            start_time_ms: self.start_time_ms,
            end_sequence,
            end_time_ms,
        });
    }

    fn active(&self) -> Option<&Arc<Session>> {
        if self.left.load(Ordering::SeqCst) {
            return None;
        }
        self.session.as_ref()
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Handle for an in-progress traced web request.
pub struct WebRequestTracer {
    session: Option<Arc<Session>>,
    url: String,
    parent_action_id: i32,
    start_sequence: i32,
    start_time_ms: i64,
    bytes_sent: Option<i64>,
    bytes_received: Option<i64>,
    stopped: AtomicBool,
}

impl WebRequestTracer {
    fn begin(session: Arc<Session>, url: &str, parent_action_id: i32) -> Self {
        let encoder = session.encoder();
        let start_sequence = encoder.next_sequence_number();
        let start_time_ms = encoder.current_timestamp_ms();
        Self {
            session: Some(session),
            url: url.to_string(),
            parent_action_id,
            start_sequence,
            start_time_ms,
            bytes_sent: None,
            bytes_received: None,
            stopped: AtomicBool::new(false),
        }
    }

    const fn inert() -> Self {
        Self {
            session: None,
            url: String::new(),
            parent_action_id: 0,
            start_sequence: 0,
            start_time_ms: 0,
            bytes_sent: None,
            bytes_received: None,
            stopped: AtomicBool::new(true),
        }
    }

    /// Records the request payload size.
    pub fn set_bytes_sent(&mut self, bytes: i64) -> &mut Self {
        self.bytes_sent = Some(bytes);
        self
    }

    /// Records the response payload size.
    pub fn set_bytes_received(&mut self, bytes: i64) -> &mut Self {
        self.bytes_received = Some(bytes);
        self
    }

    /// Finishes the trace and emits its fragment. Idempotent.
    pub fn stop(&self, response_code: i32) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        let encoder = session.encoder();
        let end_sequence = encoder.next_sequence_number();
        let end_time_ms = encoder.current_timestamp_ms();
        encoder.add_web_request(&WebRequestEvent {
            url: self.url.clone(),
            parent_action_id: self.parent_action_id,
            start_sequence: self.start_sequence,
            start_time_ms: self.start_time_ms,
            end_sequence,
            end_time_ms,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            response_code: Some(response_code),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::session::testing::test_creator;
    use crate::time::SystemClock;
    use crate::transport::testing::MockTransport;
    use crate::transport::BeaconTransport;

    struct Fixture {
        controller: SessionController,
        transport: Arc<MockTransport>,
        sender: Arc<Sender>,
        watchdog: Arc<SessionWatchdog>,
        cache: Arc<crate::cache::EventCache>,
    }

    /// Server body configuring split after 3 events, 20 min duration.
    /// Multiplicity 0 keeps the sender from flushing the cache contents
    /// these tests inspect.
    const SPLIT_BODY: &str = r#"{"appConfig":{"mes":3,"msd":20},"dynamicConfig":{"mp":0,"srvid":7}}"#;

    fn fixture(status_body: &str) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(200, status_body);
        let sender = Arc::new(Sender::new(
            Arc::clone(&transport) as Arc<dyn BeaconTransport>
        ));
        assert!(sender.wait_for_init_timeout(Duration::from_secs(2)));
        let watchdog = Arc::new(SessionWatchdog::new(Arc::new(SystemClock)));
        let (creator, cache, _) = test_creator(73);
        let controller =
            SessionController::new(creator, Arc::clone(&sender), Arc::clone(&watchdog));
        Fixture {
            controller,
            transport,
            sender,
            watchdog,
            cache,
        }
    }

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

    /// Blocks until the controller has frozen its split thresholds, i.e.
    /// the first instance received its configuration via the sender.
    fn wait_for_frozen_split_config(fx: &Fixture) {
        assert!(
            wait_until(Duration::from_secs(2), || {
                fx.controller.inner.lock_state().split_config.is_some()
            }),
            "split thresholds were never frozen"
        );
    }

    #[test]
    fn test_splits_after_configured_event_count() {
        let fx = fixture(SPLIT_BODY);
        wait_for_frozen_split_config(&fx);
        assert_eq!(fx.controller.current_key().sequence_number, 0);

        // Seven top-level actions with a threshold of 3: splits after the
        // 3rd and 6th, so the current instance has sequence number 2.
        for index in 0..7 {
            fx.controller.enter_action(&format!("action-{index}")).leave();
        }
        assert_eq!(fx.controller.current_key().sequence_number, 2);
        assert_eq!(fx.controller.current_key().session_number, 73);

        fx.controller.end();
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }

    #[test]
    fn test_no_split_without_configuration() {
        // Key-value responses carry no split thresholds; the session never
        // splits no matter how many events are recorded.
        let fx = fixture("type=m&cp=1&si=1&id=7");
        for index in 0..20 {
            fx.controller.enter_action(&format!("action-{index}")).leave();
        }
        assert_eq!(fx.controller.current_key().sequence_number, 0);
        fx.controller.end();
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }

    #[test]
    fn test_split_thresholds_frozen_at_first_configuration() {
        let fx = fixture(SPLIT_BODY);
        wait_for_frozen_split_config(&fx);

        // Later responses raise the threshold, but the frozen value of 3
        // still governs: the first split happens on the 3rd event.
        fx.transport
            .push_response(200, r#"{"appConfig":{"mes":100},"dynamicConfig":{"mp":0}}"#);
        for index in 0..3 {
            fx.controller.enter_action(&format!("action-{index}")).leave();
        }
        assert_eq!(fx.controller.current_key().sequence_number, 1);
        fx.controller.end();
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }

    #[test]
    fn test_old_instance_scheduled_with_watchdog() {
        let fx = fixture(SPLIT_BODY);
        wait_for_frozen_split_config(&fx);
        for index in 0..3 {
            fx.controller.enter_action(&format!("action-{index}")).leave();
        }
        // msd=20 minutes, grace is half of that: the old instance must be
        // pending, not closed.
        assert_eq!(fx.watchdog.pending_count(), 1);
        fx.controller.end();
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }

    #[test]
    fn test_end_is_idempotent_and_inerts_operations() {
        let fx = fixture("type=m&cp=1&si=1&id=7");
        fx.controller.end();
        fx.controller.end();

        let action = fx.controller.enter_action("late");
        action.report_event("ignored");
        action.leave();
        fx.controller.identify_user("ignored");
        fx.controller.report_crash("ignored", "reason");
        let tracer = fx.controller.trace_web_request("https://late.example.com");
        tracer.stop(200);

        // Only the start/end markers of the first instance may exist.
        let key = fx.controller.current_key();
        let chunk = fx.cache.extract_chunk(key, 64 * 1024);
        assert!(!chunk.contains("et=1&"), "no action fragment expected");
        assert!(!chunk.contains("et=60"), "no identify fragment expected");
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }

    #[test]
    fn test_action_events_do_not_count_towards_split() {
        let fx = fixture(SPLIT_BODY);
        wait_for_frozen_split_config(&fx);
        let action = fx.controller.enter_action("parent");
        for index in 0..10 {
            action.report_event(&format!("child-{index}"));
            action.report_value_int("value", index);
        }
        action.leave();
        assert_eq!(
            fx.controller.current_key().sequence_number,
            0,
            "child events must not trigger a split"
        );
        fx.controller.end();
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }

    #[test]
    fn test_action_fragment_lands_on_enter_instance() {
        let fx = fixture(SPLIT_BODY);
        wait_for_frozen_split_config(&fx);
        let first_key = fx.controller.current_key();
        let action = fx.controller.enter_action("spanning");
        // Two more top-level events push the count to the threshold and
        // split the session while `spanning` is still open.
        fx.controller.identify_user("user");
        fx.controller.report_crash("crash", "reason");
        assert_ne!(fx.controller.current_key(), first_key);

        action.leave();
        let chunk = fx.cache.extract_chunk(first_key, 64 * 1024);
        assert!(
            chunk.contains("na=spanning"),
            "action must land on the instance it was entered on"
        );
        fx.controller.end();
        fx.sender.shutdown();
        fx.watchdog.shutdown();
    }
}
