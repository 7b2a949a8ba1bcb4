//! Wire protocol definitions shared by the encoder and the response codec.
//!
//! The beacon wire format is an ASCII query string of `&`-joined `key=value`
//! tokens. Event fragments always start with the event type code (`et`)
//! followed by event-specific fields. The codes are stable backend contract
//! values and must not be renumbered.
//!
//! # Response grammars
//!
//! Server responses come in two shapes, dispatched on the payload prefix:
//!
//! - `type=m...`: legacy key-value grammar ([`keyvalue`])
//! - `{...}`: JSON grammar with `agentConfig`, `appConfig` and
//!   `dynamicConfig` sections ([`json`])
//!
//! Both produce a [`ResponseAttributes`] snapshot with explicit per-field
//! presence tracking; defaults are applied one layer up, by the sender.

pub mod attributes;
pub mod error;
pub mod json;
pub mod keyvalue;

pub use attributes::{ResponseAttribute, ResponseAttributes};
pub use error::ParseError;

/// Event type codes carried in the `et` field of every beacon fragment.
///
/// The numeric values are the backend contract; they match the monitoring
/// protocol exactly and are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
#[non_exhaustive]
pub enum EventKind {
    /// A completed (entered and left) action.
    Action = 1,
    /// A named point-in-time event.
    NamedEvent = 10,
    /// A reported string value.
    ValueString = 11,
    /// A reported integer value.
    ValueInt = 12,
    /// A reported floating-point value.
    ValueDouble = 13,
    /// Session start marker.
    SessionStart = 18,
    /// Session end marker.
    SessionEnd = 19,
    /// A traced web request.
    WebRequest = 30,
    /// A reported error.
    Error = 40,
    /// A reported crash.
    Crash = 50,
    /// A user identification event.
    IdentifyUser = 60,
}

impl EventKind {
    /// Returns the wire protocol code for this event kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns whether fragments of this kind are stored in the
    /// action-class record list (as opposed to the event-class list).
    ///
    /// Only completed actions go to the action list; everything else,
    /// including session markers, is event-class data.
    #[must_use]
    pub const fn is_action_class(self) -> bool {
        matches!(self, Self::Action)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Beacon fragment field keys.
pub mod field {
    /// Event type code.
    pub const EVENT_TYPE: &str = "et";
    /// Event or action name (percent-encoded).
    pub const NAME: &str = "na";
    /// Reporting thread identity.
    pub const THREAD_ID: &str = "it";
    /// Parent action id (0 for top-level).
    pub const PARENT_ACTION_ID: &str = "pa";
    /// Action id.
    pub const ACTION_ID: &str = "ca";
    /// Sequence number at event/action start.
    pub const START_SEQUENCE: &str = "s0";
    /// Time offset (ms since session start) at start.
    pub const TIME_0: &str = "t0";
    /// Sequence number at action end.
    pub const END_SEQUENCE: &str = "s1";
    /// Duration (ms) between start and end.
    pub const TIME_1: &str = "t1";
    /// Reported value payload (percent-encoded).
    pub const VALUE: &str = "vl";
    /// Error code / error value.
    pub const ERROR_VALUE: &str = "ev";
    /// Bytes sent on a traced web request.
    pub const BYTES_SENT: &str = "bs";
    /// Bytes received on a traced web request.
    pub const BYTES_RECEIVED: &str = "br";
    /// HTTP response code of a traced web request.
    pub const RESPONSE_CODE: &str = "rc";
}

/// Parses a raw response body into attributes, dispatching on payload shape.
///
/// A `type=m` prefix selects the legacy key-value grammar; a payload whose
/// first non-whitespace byte is `{` selects the JSON grammar.
///
/// # Errors
///
/// Returns [`ParseError::UnsupportedFormat`] when the payload matches
/// neither grammar, or the grammar-specific error when parsing fails.
pub fn parse_response(body: &str) -> Result<ResponseAttributes, ParseError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with(keyvalue::RESPONSE_PREFIX) {
        keyvalue::parse(body)
    } else if trimmed.starts_with('{') {
        json::parse(trimmed)
    } else {
        Err(ParseError::UnsupportedFormat {
            prefix: trimmed.chars().take(8).collect(),
        })
    }
}
