//! Per-session beacon encoding.
//!
//! A [`BeaconEncoder`] owns one session instance's identity (its
//! [`SessionKey`]), its object-id and sequence-number counters, and produces
//! wire-format query-string fragments which it appends to the shared
//! [`EventCache`]. Ids and sequence numbers are drawn from atomic counters
//! at the moment of each call and never recomputed later, which guarantees
//! stable within-session ordering even under concurrent callers.
//!
//! # Privacy gating
//!
//! The host-configured [`DataCollectionLevel`] decides per call whether a
//! fragment is emitted at all and whether identifying fields (device id,
//! free-form values) go on the wire:
//!
//! - `Off` suppresses everything.
//! - `Performance` records actions, errors, crashes, web requests and
//!   session markers, without identifying fields.
//! - `UserBehavior` additionally records named events, reported values and
//!   user identification, with identifying fields.
//!
//! Error and crash fragments are additionally gated by the current server
//! configuration's reporting predicates.
//!
//! # Chunk prefix
//!
//! Every transmitted payload starts with a session prefix (`ap` application
//! id, `dv` device id, `sn` session number, `ss` session sequence number,
//! `vs` visit-store version) followed by the extracted event fragments.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::cache::{EventCache, RecordClass, SessionKey};
use crate::config::{ConfigurationSlot, DataCollectionLevel};
use crate::protocol::{field, EventKind};
use crate::time::Clock;

/// Characters allowed unescaped in wire values, beyond alphanumerics.
const WIRE_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Prefix field: application id.
const PREFIX_APPLICATION_ID: &str = "ap";
/// Prefix field: device id.
const PREFIX_DEVICE_ID: &str = "dv";
/// Prefix field: session number.
const PREFIX_SESSION_NUMBER: &str = "sn";
/// Prefix field: session sequence number.
const PREFIX_SESSION_SEQUENCE: &str = "ss";
/// Prefix field: visit-store version.
const PREFIX_VISIT_STORE: &str = "vs";

/// A completed action, reported as one fragment when the action is left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEvent {
    /// Action name.
    pub name: String,
    /// Action id drawn from the encoder at enter time.
    pub id: i32,
    /// Parent action id (0 for top-level actions).
    pub parent_id: i32,
    /// Sequence number drawn at enter time.
    pub start_sequence: i32,
    /// Timestamp at enter time, epoch ms.
    pub start_time_ms: i64,
    /// Sequence number drawn at leave time.
    pub end_sequence: i32,
    /// Timestamp at leave time, epoch ms.
    pub end_time_ms: i64,
}

/// A completed traced web request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRequestEvent {
    /// Traced URL.
    pub url: String,
    /// Parent action id (0 when traced outside an action).
    pub parent_action_id: i32,
    /// Sequence number drawn at start.
    pub start_sequence: i32,
    /// Timestamp at start, epoch ms.
    pub start_time_ms: i64,
    /// Sequence number drawn at stop.
    pub end_sequence: i32,
    /// Timestamp at stop, epoch ms.
    pub end_time_ms: i64,
    /// Bytes sent, if known.
    pub bytes_sent: Option<i64>,
    /// Bytes received, if known.
    pub bytes_received: Option<i64>,
    /// HTTP response code, if known.
    pub response_code: Option<i32>,
}

/// Produces wire-format fragments for one session instance.
pub struct BeaconEncoder {
    key: SessionKey,
    cache: Arc<EventCache>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigurationSlot>,
    application_id: String,
    device_id: i64,
    data_collection_level: DataCollectionLevel,
    session_start_time_ms: i64,
    next_id: AtomicI32,
    next_sequence: AtomicI32,
}

impl BeaconEncoder {
    /// Creates an encoder for a new session instance, capturing the session
    /// start time from the clock.
    #[must_use]
    pub fn new(
        key: SessionKey,
        cache: Arc<EventCache>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigurationSlot>,
        application_id: String,
        device_id: i64,
        data_collection_level: DataCollectionLevel,
    ) -> Self {
        let session_start_time_ms = clock.now_ms();
        Self {
            key,
            cache,
            clock,
            config,
            application_id,
            device_id,
            data_collection_level,
            session_start_time_ms,
            next_id: AtomicI32::new(1),
            next_sequence: AtomicI32::new(1),
        }
    }

    /// The session instance this encoder writes for.
    #[must_use]
    pub const fn key(&self) -> SessionKey {
        self.key
    }

    /// Draws the next object id (monotonic, starting at 1).
    ///
    /// Callers must never recompute ids from elsewhere; the counter is the
    /// single source.
    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Draws the next sequence number (monotonic, starting at 1).
    pub fn next_sequence_number(&self) -> i32 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Current timestamp from the encoder's clock, epoch ms.
    #[must_use]
    pub fn current_timestamp_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Session start time, epoch ms.
    #[must_use]
    pub const fn session_start_time_ms(&self) -> i64 {
        self.session_start_time_ms
    }

    fn time_offset_ms(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - self.session_start_time_ms
    }

    /// Emits the SESSION_START marker.
    pub fn start_session(&self) {
        if !self.data_collection_level.allows_performance_events() {
            return;
        }
        let mut fragment = self.basic_fragment(EventKind::SessionStart, None, 0);
        append_field(&mut fragment, field::START_SEQUENCE, self.next_sequence_number());
        append_field(&mut fragment, field::TIME_0, 0);
        self.append_to_cache(EventKind::SessionStart, self.session_start_time_ms, fragment);
    }

    /// Emits the SESSION_END marker.
    pub fn end_session(&self) {
        if !self.data_collection_level.allows_performance_events() {
            return;
        }
        let now = self.current_timestamp_ms();
        let mut fragment = self.basic_fragment(EventKind::SessionEnd, None, 0);
        append_field(&mut fragment, field::START_SEQUENCE, self.next_sequence_number());
        append_field(&mut fragment, field::TIME_0, self.time_offset_ms(now));
        self.append_to_cache(EventKind::SessionEnd, now, fragment);
    }

    /// Emits a completed action.
    pub fn add_action(&self, action: &ActionEvent) {
        if !self.data_collection_level.allows_performance_events() {
            return;
        }
        let mut fragment = self.basic_fragment(EventKind::Action, Some(&action.name), action.parent_id);
        append_field(&mut fragment, field::ACTION_ID, action.id);
        append_field(&mut fragment, field::START_SEQUENCE, action.start_sequence);
        append_field(&mut fragment, field::TIME_0, self.time_offset_ms(action.start_time_ms));
        append_field(&mut fragment, field::END_SEQUENCE, action.end_sequence);
        append_field(&mut fragment, field::TIME_1, action.end_time_ms - action.start_time_ms);
        self.append_to_cache(EventKind::Action, action.start_time_ms, fragment);
    }

    /// Emits a named point-in-time event under the given parent action.
    pub fn report_event(&self, parent_action_id: i32, name: &str) {
        if !self.data_collection_level.allows_behavior_events() {
            return;
        }
        self.report_timed(EventKind::NamedEvent, parent_action_id, name, |_| {});
    }

    /// Emits a reported string value.
    pub fn report_value_string(&self, parent_action_id: i32, name: &str, value: &str) {
        if !self.data_collection_level.allows_behavior_events() {
            return;
        }
        let encoded = encode_value(value);
        self.report_timed(EventKind::ValueString, parent_action_id, name, |fragment| {
            append_raw_field(fragment, field::VALUE, &encoded);
        });
    }

    /// Emits a reported integer value.
    pub fn report_value_int(&self, parent_action_id: i32, name: &str, value: i64) {
        if !self.data_collection_level.allows_behavior_events() {
            return;
        }
        self.report_timed(EventKind::ValueInt, parent_action_id, name, |fragment| {
            append_field(fragment, field::VALUE, value);
        });
    }

    /// Emits a reported floating-point value.
    pub fn report_value_double(&self, parent_action_id: i32, name: &str, value: f64) {
        if !self.data_collection_level.allows_behavior_events() {
            return;
        }
        self.report_timed(EventKind::ValueDouble, parent_action_id, name, |fragment| {
            append_raw_field(fragment, field::VALUE, &value.to_string());
        });
    }

    /// Emits an error report.
    pub fn report_error(&self, parent_action_id: i32, name: &str, error_code: i32) {
        if !self.data_collection_level.allows_performance_events() {
            return;
        }
        if !self.config.get().is_sending_errors_allowed() {
            return;
        }
        self.report_timed(EventKind::Error, parent_action_id, name, |fragment| {
            append_field(fragment, field::ERROR_VALUE, error_code);
        });
    }

    /// Emits a crash report.
    pub fn report_crash(&self, name: &str, reason: &str) {
        if !self.data_collection_level.allows_performance_events() {
            return;
        }
        if !self.config.get().is_sending_crashes_allowed() {
            return;
        }
        let encoded = encode_value(reason);
        self.report_timed(EventKind::Crash, 0, name, |fragment| {
            append_raw_field(fragment, field::VALUE, &encoded);
        });
    }

    /// Emits a user identification event.
    pub fn identify_user(&self, user_tag: &str) {
        if !self.data_collection_level.allows_behavior_events() {
            return;
        }
        self.report_timed(EventKind::IdentifyUser, 0, user_tag, |_| {});
    }

    /// Emits a completed traced web request.
    pub fn add_web_request(&self, request: &WebRequestEvent) {
        if !self.data_collection_level.allows_performance_events() {
            return;
        }
        let mut fragment =
            self.basic_fragment(EventKind::WebRequest, Some(&request.url), request.parent_action_id);
        append_field(&mut fragment, field::START_SEQUENCE, request.start_sequence);
        append_field(&mut fragment, field::TIME_0, self.time_offset_ms(request.start_time_ms));
        append_field(&mut fragment, field::END_SEQUENCE, request.end_sequence);
        append_field(&mut fragment, field::TIME_1, request.end_time_ms - request.start_time_ms);
        if let Some(sent) = request.bytes_sent {
            append_field(&mut fragment, field::BYTES_SENT, sent);
        }
        if let Some(received) = request.bytes_received {
            append_field(&mut fragment, field::BYTES_RECEIVED, received);
        }
        if let Some(code) = request.response_code {
            append_field(&mut fragment, field::RESPONSE_CODE, code);
        }
        self.append_to_cache(EventKind::WebRequest, request.start_time_ms, fragment);
    }

    /// Extracts the next transmission chunk, with the session prefix
    /// prepended, bounded by the current beacon size limit.
    ///
    /// Returns `None` when no data is pending.
    #[must_use]
    pub fn next_chunk(&self) -> Option<String> {
        if self.cache.is_empty(self.key) {
            return None;
        }
        let prefix = self.chunk_prefix();
        let beacon_size = self.config.get().beacon_size_bytes.max(0) as usize;
        let budget = beacon_size.saturating_sub(prefix.len() + 1);
        let chunk = self.cache.extract_chunk(self.key, budget);
        if chunk.is_empty() {
            return None;
        }
        Some(format!("{prefix}&{chunk}"))
    }

    /// Returns whether this session has no pending data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty(self.key)
    }

    /// Drops this session's cache slot; called when the session finally
    /// closes and is unregistered from the sender.
    pub fn clear(&self) {
        self.cache.delete_entry(self.key);
    }

    fn chunk_prefix(&self) -> String {
        let mut prefix = String::new();
        append_raw_field(
            &mut prefix,
            PREFIX_APPLICATION_ID,
            &encode_value(&self.application_id),
        );
        // Device id and session number identify the user across sessions;
        // below `UserBehavior` the device id is dropped and the session
        // number degrades to a fixed placeholder.
        let session_number = if self.data_collection_level.allows_identifying_fields() {
            append_field(&mut prefix, PREFIX_DEVICE_ID, self.device_id);
            self.key.session_number
        } else {
            1
        };
        append_field(&mut prefix, PREFIX_SESSION_NUMBER, session_number);
        append_field(&mut prefix, PREFIX_SESSION_SEQUENCE, self.key.sequence_number);
        append_field(
            &mut prefix,
            PREFIX_VISIT_STORE,
            self.config.get().visit_store_version,
        );
        prefix
    }

    /// Builds the common fragment head: `et`, optional `na`, `it`, `pa`.
    fn basic_fragment(&self, kind: EventKind, name: Option<&str>, parent_id: i32) -> String {
        let mut fragment = String::new();
        append_field(&mut fragment, field::EVENT_TYPE, kind.code());
        if let Some(name) = name {
            append_raw_field(&mut fragment, field::NAME, &encode_value(name));
        }
        append_field(&mut fragment, field::THREAD_ID, current_thread_id());
        append_field(&mut fragment, field::PARENT_ACTION_ID, parent_id);
        fragment
    }

    /// Emits a fragment with `s0`/`t0` drawn now, plus kind-specific fields.
    fn report_timed(
        &self,
        kind: EventKind,
        parent_action_id: i32,
        name: &str,
        extra: impl FnOnce(&mut String),
    ) {
        let now = self.current_timestamp_ms();
        let mut fragment = self.basic_fragment(kind, Some(name), parent_action_id);
        append_field(&mut fragment, field::START_SEQUENCE, self.next_sequence_number());
        append_field(&mut fragment, field::TIME_0, self.time_offset_ms(now));
        extra(&mut fragment);
        self.append_to_cache(kind, now, fragment);
    }

    fn append_to_cache(&self, kind: EventKind, timestamp_ms: i64, fragment: String) {
        let class = if kind.is_action_class() {
            RecordClass::Action
        } else {
            RecordClass::Event
        };
        self.cache.append(self.key, class, timestamp_ms, fragment);
    }
}

fn append_field<T: std::fmt::Display>(fragment: &mut String, key: &str, value: T) {
    append_raw_field(fragment, key, &value.to_string());
}

fn append_raw_field(fragment: &mut String, key: &str, value: &str) {
    if !fragment.is_empty() {
        fragment.push('&');
    }
    fragment.push_str(key);
    fragment.push('=');
    fragment.push_str(value);
}

fn encode_value(value: &str) -> String {
    utf8_percent_encode(value, WIRE_SAFE).to_string()
}

/// Stable numeric identity for the reporting thread.
fn current_thread_id() -> i64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    // Fold to a positive value; the wire field is a plain integer.
    (hasher.finish() & 0x7fff_ffff) as i64
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::ServerConfiguration;
    use crate::protocol::ResponseAttributes;
    use crate::time::testing::FakeClock;

    struct Fixture {
        cache: Arc<EventCache>,
        clock: Arc<FakeClock>,
        config: Arc<ConfigurationSlot>,
        encoder: BeaconEncoder,
    }

    fn fixture(level: DataCollectionLevel) -> Fixture {
        let cache = Arc::new(EventCache::new());
        let clock = Arc::new(FakeClock::new(10_000));
        let config = Arc::new(ConfigurationSlot::default());
        let encoder = BeaconEncoder::new(
            SessionKey::new(17),
            Arc::clone(&cache),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&config),
            "app-1".to_string(),
            999,
            level,
        );
        Fixture {
            cache,
            clock,
            config,
            encoder,
        }
    }

    /// Splits a fragment back into a key -> value map.
    fn decode(fragment: &str) -> HashMap<String, String> {
        fragment
            .split('&')
            .map(|token| {
                let (k, v) = token.split_once('=').expect("key=value token");
                (k.to_string(), v.to_string())
            })
            .collect()
    }

    fn single_fragment(fx: &Fixture) -> HashMap<String, String> {
        let chunk = fx.cache.extract_chunk(fx.encoder.key(), 64 * 1024);
        assert!(!chunk.is_empty(), "expected a pending fragment");
        decode(&chunk)
    }

    #[test]
    fn test_ids_and_sequences_start_at_one() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        assert_eq!(fx.encoder.next_id(), 1);
        assert_eq!(fx.encoder.next_id(), 2);
        assert_eq!(fx.encoder.next_sequence_number(), 1);
        assert_eq!(fx.encoder.next_sequence_number(), 2);
    }

    #[test]
    fn test_session_start_fragment() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.encoder.start_session();
        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "18");
        assert_eq!(fields["pa"], "0");
        assert_eq!(fields["s0"], "1");
        assert_eq!(fields["t0"], "0");
        assert!(fields.contains_key("it"));
    }

    #[test]
    fn test_action_round_trip_preserves_assigned_ids() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        let id = fx.encoder.next_id();
        let start_sequence = fx.encoder.next_sequence_number();
        let start_time_ms = fx.encoder.current_timestamp_ms();
        fx.clock.advance(250);
        let end_sequence = fx.encoder.next_sequence_number();
        let action = ActionEvent {
            name: "load page".to_string(),
            id,
            parent_id: 0,
            start_sequence,
            start_time_ms,
            end_sequence,
            end_time_ms: fx.encoder.current_timestamp_ms(),
        };
        fx.encoder.add_action(&action);

        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "1");
        assert_eq!(fields["ca"], id.to_string());
        assert_eq!(fields["pa"], "0");
        assert_eq!(fields["s0"], start_sequence.to_string());
        assert_eq!(fields["s1"], end_sequence.to_string());
        assert_eq!(fields["t0"], "0");
        assert_eq!(fields["t1"], "250");
        assert_eq!(fields["na"], "load%20page");
    }

    #[test]
    fn test_actions_are_action_class_records() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.encoder.report_event(0, "evt");
        fx.encoder.add_action(&ActionEvent {
            name: "a".to_string(),
            id: 1,
            parent_id: 0,
            start_sequence: 1,
            start_time_ms: 10_000,
            end_sequence: 2,
            end_time_ms: 10_001,
        });
        // Events drain before actions regardless of insertion order.
        let chunk = fx.cache.extract_chunk(fx.encoder.key(), 64 * 1024);
        let first = chunk.split("&et=").next().unwrap();
        assert!(first.starts_with("et=10"), "chunk was: {chunk}");
    }

    #[test]
    fn test_values_carry_payload() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.encoder.report_value_int(3, "count", -7);
        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "12");
        assert_eq!(fields["na"], "count");
        assert_eq!(fields["pa"], "3");
        assert_eq!(fields["vl"], "-7");

        fx.encoder.report_value_string(0, "label", "a b&c");
        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "11");
        assert_eq!(fields["vl"], "a%20b%26c");
    }

    #[test]
    fn test_error_and_crash_fragments() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.encoder.report_error(2, "io failure", 418);
        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "40");
        assert_eq!(fields["ev"], "418");
        assert_eq!(fields["pa"], "2");

        fx.encoder.report_crash("oom", "out of memory");
        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "50");
        assert_eq!(fields["na"], "oom");
        assert_eq!(fields["vl"], "out%20of%20memory");
    }

    #[test]
    fn test_errors_gated_by_server_configuration() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.config.set(ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults()
                .with_capture(true)
                .with_capture_errors(false),
        ));
        fx.encoder.report_error(0, "suppressed", 1);
        assert!(fx.encoder.is_empty());
    }

    #[test]
    fn test_crashes_gated_by_server_configuration() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.config.set(ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults()
                .with_capture(true)
                .with_capture_crashes(false),
        ));
        fx.encoder.report_crash("suppressed", "reason");
        assert!(fx.encoder.is_empty());
    }

    #[test]
    fn test_off_level_suppresses_everything() {
        let fx = fixture(DataCollectionLevel::Off);
        fx.encoder.start_session();
        fx.encoder.report_event(0, "evt");
        fx.encoder.report_crash("crash", "reason");
        fx.encoder.identify_user("user");
        fx.encoder.end_session();
        assert!(fx.encoder.is_empty());
        assert_eq!(fx.cache.total_size(), 0);
    }

    #[test]
    fn test_performance_level_gating() {
        let fx = fixture(DataCollectionLevel::Performance);
        fx.encoder.report_event(0, "evt");
        fx.encoder.report_value_int(0, "v", 1);
        fx.encoder.identify_user("user");
        assert!(fx.encoder.is_empty(), "behavior events must be suppressed");

        fx.encoder.report_error(0, "err", 1);
        assert!(!fx.encoder.is_empty(), "errors are performance-class");
    }

    #[test]
    fn test_chunk_prefix_and_identifying_fields() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.encoder.start_session();
        let chunk = fx.encoder.next_chunk().unwrap();
        assert!(chunk.starts_with("ap=app-1&dv=999&sn=17&ss=0&vs="));
        assert!(chunk.contains("et=18"));

        let fx = fixture(DataCollectionLevel::Performance);
        fx.encoder.start_session();
        let chunk = fx.encoder.next_chunk().unwrap();
        assert!(!chunk.contains("dv="), "device id is identifying");
        assert!(
            chunk.starts_with("ap=app-1&sn=1&ss=0&"),
            "session number must degrade to the placeholder; chunk was: {chunk}"
        );
        assert!(!chunk.contains("sn=17"));
    }

    #[test]
    fn test_next_chunk_none_when_empty() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        assert!(fx.encoder.next_chunk().is_none());
    }

    #[test]
    fn test_web_request_fragment() {
        let fx = fixture(DataCollectionLevel::Performance);
        fx.encoder.add_web_request(&WebRequestEvent {
            url: "https://api.example.com/v1?q=1".to_string(),
            parent_action_id: 4,
            start_sequence: 1,
            start_time_ms: 10_000,
            end_sequence: 2,
            end_time_ms: 10_300,
            bytes_sent: Some(120),
            bytes_received: Some(4_096),
            response_code: Some(200),
        });
        let fields = single_fragment(&fx);
        assert_eq!(fields["et"], "30");
        assert_eq!(fields["pa"], "4");
        assert_eq!(fields["t1"], "300");
        assert_eq!(fields["bs"], "120");
        assert_eq!(fields["br"], "4096");
        assert_eq!(fields["rc"], "200");
        assert!(fields["na"].contains("https%3A%2F%2F"));
    }

    #[test]
    fn test_clear_drops_cache_slot() {
        let fx = fixture(DataCollectionLevel::UserBehavior);
        fx.encoder.start_session();
        assert!(!fx.encoder.is_empty());
        fx.encoder.clear();
        assert!(fx.encoder.is_empty());
        assert_eq!(fx.cache.total_size(), 0);
    }
}
