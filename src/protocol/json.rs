//! JSON response grammar.
//!
//! Newer backends answer with a JSON object carrying three sections plus a
//! top-level timestamp. Unknown sections and keys are ignored for forward
//! compatibility; only a payload that is not valid JSON at all is an error.
//!
//! ```json
//! {
//!   "agentConfig":   { "bl": 150, "si": 120 },
//!   "appConfig":     { "cp": 1, "cr": 1, "er": 1,
//!                      "msd": 360, "mes": 200, "stt": 600, "vs": 1 },
//!   "dynamicConfig": { "mp": 1, "srvid": 1, "tc": 100 },
//!   "timestamp": 1700000000000
//! }
//! ```
//!
//! Wire units match the key-value grammar: `bl` is KB, `si` and `stt` are
//! seconds, `msd` is minutes. Conversion to bytes/milliseconds happens here.

use serde_json::Value;

use super::attributes::ResponseAttributes;
use super::error::ParseError;

const SECTION_AGENT_CONFIG: &str = "agentConfig";
const SECTION_APP_CONFIG: &str = "appConfig";
const SECTION_DYNAMIC_CONFIG: &str = "dynamicConfig";
const KEY_TIMESTAMP: &str = "timestamp";

const KEY_BEACON_SIZE_KB: &str = "bl";
const KEY_SEND_INTERVAL_SEC: &str = "si";
const KEY_CAPTURE: &str = "cp";
const KEY_CAPTURE_CRASHES: &str = "cr";
const KEY_CAPTURE_ERRORS: &str = "er";
const KEY_MAX_SESSION_DURATION_MIN: &str = "msd";
const KEY_MAX_EVENTS_PER_SESSION: &str = "mes";
const KEY_SESSION_TIMEOUT_SEC: &str = "stt";
const KEY_VISIT_STORE_VERSION: &str = "vs";
const KEY_MULTIPLICITY: &str = "mp";
const KEY_SERVER_ID: &str = "srvid";
const KEY_TRAFFIC_CONTROL: &str = "tc";

/// Parses a JSON response into attributes.
///
/// # Errors
///
/// Returns [`ParseError::Json`] when the payload is not well-formed JSON.
pub fn parse(body: &str) -> Result<ResponseAttributes, ParseError> {
    let root: Value = serde_json::from_str(body)?;
    let mut attrs = ResponseAttributes::json_defaults();

    if let Some(agent) = root.get(SECTION_AGENT_CONFIG) {
        if let Some(kb) = read_i32(agent, KEY_BEACON_SIZE_KB) {
            attrs = attrs.with_beacon_size_bytes(kb.saturating_mul(1024));
        }
        if let Some(sec) = read_i32(agent, KEY_SEND_INTERVAL_SEC) {
            attrs = attrs.with_send_interval_ms(sec.saturating_mul(1000));
        }
    }

    if let Some(app) = root.get(SECTION_APP_CONFIG) {
        if let Some(cp) = read_i32(app, KEY_CAPTURE) {
            attrs = attrs.with_capture(cp == 1);
        }
        if let Some(cr) = read_i32(app, KEY_CAPTURE_CRASHES) {
            attrs = attrs.with_capture_crashes(cr == 1);
        }
        if let Some(er) = read_i32(app, KEY_CAPTURE_ERRORS) {
            attrs = attrs.with_capture_errors(er == 1);
        }
        if let Some(min) = read_i32(app, KEY_MAX_SESSION_DURATION_MIN) {
            attrs = attrs.with_max_session_duration_ms(min.saturating_mul(60_000));
        }
        if let Some(events) = read_i32(app, KEY_MAX_EVENTS_PER_SESSION) {
            attrs = attrs.with_max_events_per_session(events);
        }
        if let Some(sec) = read_i32(app, KEY_SESSION_TIMEOUT_SEC) {
            attrs = attrs.with_session_timeout_ms(sec.saturating_mul(1000));
        }
        if let Some(version) = read_i32(app, KEY_VISIT_STORE_VERSION) {
            attrs = attrs.with_visit_store_version(version);
        }
    }

    if let Some(dynamic) = root.get(SECTION_DYNAMIC_CONFIG) {
        if let Some(mp) = read_i32(dynamic, KEY_MULTIPLICITY) {
            attrs = attrs.with_multiplicity(mp);
        }
        if let Some(id) = read_i32(dynamic, KEY_SERVER_ID) {
            attrs = attrs.with_server_id(id);
        }
        if let Some(tc) = read_i32(dynamic, KEY_TRAFFIC_CONTROL) {
            attrs = attrs.with_traffic_control_percentage(tc);
        }
    }

    if let Some(ts) = root.get(KEY_TIMESTAMP).and_then(Value::as_i64) {
        attrs = attrs.with_timestamp_ms(ts);
    }

    Ok(attrs)
}

fn read_i32(section: &Value, key: &str) -> Option<i32> {
    section
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
}
