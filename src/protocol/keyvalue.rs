//! Legacy key-value response grammar.
//!
//! The legacy backend answers with `&`-joined `key=value` pairs, always
//! starting with `type=m`. Numeric fields arrive in wire units (beacon size
//! in kilobytes, send interval in seconds) and are converted to internal
//! units here, at parse time.
//!
//! | Key | Meaning | Wire unit |
//! |-----|---------|-----------|
//! | `bl` | maximum beacon size | KB |
//! | `si` | send interval | seconds |
//! | `id` | server id | - |
//! | `cp` | capture on/off | 0 or 1 |
//! | `cr` | capture crashes | 0 or 1 |
//! | `er` | capture errors | 0 or 1 |
//! | `mp` | multiplicity | - |
//!
//! Unknown keys are ignored. An odd token count (a key without a value)
//! makes the whole response invalid.

use super::attributes::ResponseAttributes;
use super::error::ParseError;

/// Prefix identifying a key-value response (`type=m`).
pub const RESPONSE_PREFIX: &str = "type=m";

const KEY_RESPONSE_TYPE: &str = "type";
const KEY_BEACON_SIZE_KB: &str = "bl";
const KEY_SEND_INTERVAL_SEC: &str = "si";
const KEY_SERVER_ID: &str = "id";
const KEY_CAPTURE: &str = "cp";
const KEY_CAPTURE_CRASHES: &str = "cr";
const KEY_CAPTURE_ERRORS: &str = "er";
const KEY_MULTIPLICITY: &str = "mp";

/// Parses a legacy key-value response into attributes.
///
/// # Errors
///
/// Returns [`ParseError::InvalidKeyValueFormat`] when tokens cannot be
/// paired, and [`ParseError::InvalidNumericValue`] when a known numeric key
/// carries a non-numeric value.
pub fn parse(body: &str) -> Result<ResponseAttributes, ParseError> {
    let tokens: Vec<&str> = body.split(['&', '=']).collect();
    if tokens.len() % 2 != 0 {
        return Err(ParseError::InvalidKeyValueFormat {
            token_count: tokens.len(),
        });
    }

    let mut attrs = ResponseAttributes::key_value_defaults();
    for pair in tokens.chunks_exact(2) {
        let (key, value) = (pair[0], pair[1]);
        attrs = match key {
            KEY_RESPONSE_TYPE => attrs,
            KEY_BEACON_SIZE_KB => attrs.with_beacon_size_bytes(parse_i32(key, value)? * 1024),
            KEY_SEND_INTERVAL_SEC => attrs.with_send_interval_ms(parse_i32(key, value)? * 1000),
            KEY_SERVER_ID => attrs.with_server_id(parse_i32(key, value)?),
            KEY_CAPTURE => attrs.with_capture(parse_i32(key, value)? == 1),
            KEY_CAPTURE_CRASHES => attrs.with_capture_crashes(parse_i32(key, value)? == 1),
            KEY_CAPTURE_ERRORS => attrs.with_capture_errors(parse_i32(key, value)? == 1),
            KEY_MULTIPLICITY => attrs.with_multiplicity(parse_i32(key, value)?),
            // Unknown keys are forward compatibility, not errors.
            _ => attrs,
        };
    }
    Ok(attrs)
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidNumericValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}
