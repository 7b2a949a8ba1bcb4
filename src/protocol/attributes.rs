//! Parsed server response snapshot with per-field presence tracking.
//!
//! A [`ResponseAttributes`] value records both the field values read from a
//! server response and, separately, *which* fields the response actually
//! carried. Absence is tracked in an explicit bitmask rather than through
//! sentinel values, so a `-1` in a default profile is an ordinary value and
//! never doubles as an "unset" marker.
//!
//! Three default profiles exist because the JSON and key-value backends
//! historically ship different defaults, and a third profile covers the
//! window before any server contact:
//!
//! | Profile | Beacon size | Split thresholds |
//! |---------|-------------|------------------|
//! | [`ResponseAttributes::json_defaults`] | 150 KB | 360 min / 200 events / 600 s |
//! | [`ResponseAttributes::key_value_defaults`] | 30 KB | unset (-1) |
//! | [`ResponseAttributes::undefined`] | 30 KB | unset (-1), server id -1 |

/// Identifies one field of a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResponseAttribute {
    /// Whether the backend wants any data at all.
    Capture,
    /// Whether crash reports are wanted.
    CaptureCrashes,
    /// Whether error reports are wanted.
    CaptureErrors,
    /// Server id to address subsequent requests to.
    ServerId,
    /// Maximum beacon payload size in bytes.
    BeaconSizeBytes,
    /// Sampling multiplicity.
    Multiplicity,
    /// Interval between send cycles in milliseconds.
    SendIntervalMs,
    /// Maximum session duration before splitting, in milliseconds.
    MaxSessionDurationMs,
    /// Maximum top-level events per session before splitting.
    MaxEventsPerSession,
    /// Idle timeout before splitting, in milliseconds.
    SessionTimeoutMs,
    /// Backend visit-store schema version.
    VisitStoreVersion,
    /// Traffic control percentage (0-100).
    TrafficControlPercentage,
    /// Server timestamp in milliseconds.
    TimestampMs,
}

impl ResponseAttribute {
    /// All attributes, for exhaustive iteration in tests and merges.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Capture,
            Self::CaptureCrashes,
            Self::CaptureErrors,
            Self::ServerId,
            Self::BeaconSizeBytes,
            Self::Multiplicity,
            Self::SendIntervalMs,
            Self::MaxSessionDurationMs,
            Self::MaxEventsPerSession,
            Self::SessionTimeoutMs,
            Self::VisitStoreVersion,
            Self::TrafficControlPercentage,
            Self::TimestampMs,
        ]
    }

    /// Returns this attribute's bit in the presence mask.
    #[must_use]
    pub const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Immutable snapshot of one parsed server response.
///
/// Numeric fields are already unit-converted to the agent's internal units
/// (bytes and milliseconds); conversion happens at parse time, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseAttributes {
    /// Whether capture is enabled.
    pub capture: bool,
    /// Whether crash reporting is enabled.
    pub capture_crashes: bool,
    /// Whether error reporting is enabled.
    pub capture_errors: bool,
    /// Server id for subsequent requests.
    pub server_id: i32,
    /// Maximum beacon size in bytes.
    pub beacon_size_bytes: i32,
    /// Sampling multiplicity.
    pub multiplicity: i32,
    /// Send interval in milliseconds.
    pub send_interval_ms: i32,
    /// Maximum session duration in milliseconds (-1 = unset).
    pub max_session_duration_ms: i32,
    /// Maximum top-level events per session (-1 = unset).
    pub max_events_per_session: i32,
    /// Idle timeout in milliseconds (-1 = unset).
    pub session_timeout_ms: i32,
    /// Visit-store schema version.
    pub visit_store_version: i32,
    /// Traffic control percentage.
    pub traffic_control_percentage: i32,
    /// Server timestamp in milliseconds.
    pub timestamp_ms: i64,
    set_mask: u16,
}

impl ResponseAttributes {
    /// Default profile applied when a JSON response omits fields.
    #[must_use]
    pub const fn json_defaults() -> Self {
        Self {
            capture: true,
            capture_crashes: true,
            capture_errors: true,
            server_id: 1,
            beacon_size_bytes: 150 * 1024,
            multiplicity: 1,
            send_interval_ms: 120_000,
            max_session_duration_ms: 360 * 60 * 1000,
            max_events_per_session: 200,
            session_timeout_ms: 600_000,
            visit_store_version: 1,
            traffic_control_percentage: 100,
            timestamp_ms: 0,
            set_mask: 0,
        }
    }

    /// Default profile applied when a key-value response omits fields.
    ///
    /// The key-value backend never dictated split thresholds, so they stay
    /// unset here.
    #[must_use]
    pub const fn key_value_defaults() -> Self {
        Self {
            beacon_size_bytes: 30 * 1024,
            max_session_duration_ms: -1,
            max_events_per_session: -1,
            session_timeout_ms: -1,
            ..Self::json_defaults()
        }
    }

    /// Profile in effect before any server contact.
    #[must_use]
    pub const fn undefined() -> Self {
        Self {
            server_id: -1,
            ..Self::key_value_defaults()
        }
    }

    /// Returns whether the response carried the given field.
    #[must_use]
    pub const fn is_set(&self, attribute: ResponseAttribute) -> bool {
        self.set_mask & attribute.bit() != 0
    }

    /// Returns whether the response carried no fields at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.set_mask == 0
    }

    /// Sets the capture flag and marks it present.
    #[must_use]
    pub const fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self.set_mask |= ResponseAttribute::Capture.bit();
        self
    }

    /// Sets the crash-reporting flag and marks it present.
    #[must_use]
    pub const fn with_capture_crashes(mut self, capture_crashes: bool) -> Self {
        self.capture_crashes = capture_crashes;
        self.set_mask |= ResponseAttribute::CaptureCrashes.bit();
        self
    }

    /// Sets the error-reporting flag and marks it present.
    #[must_use]
    pub const fn with_capture_errors(mut self, capture_errors: bool) -> Self {
        self.capture_errors = capture_errors;
        self.set_mask |= ResponseAttribute::CaptureErrors.bit();
        self
    }

    /// Sets the server id and marks it present.
    #[must_use]
    pub const fn with_server_id(mut self, server_id: i32) -> Self {
        self.server_id = server_id;
        self.set_mask |= ResponseAttribute::ServerId.bit();
        self
    }

    /// Sets the beacon size (bytes) and marks it present.
    #[must_use]
    pub const fn with_beacon_size_bytes(mut self, beacon_size_bytes: i32) -> Self {
        self.beacon_size_bytes = beacon_size_bytes;
        self.set_mask |= ResponseAttribute::BeaconSizeBytes.bit();
        self
    }

    /// Sets the multiplicity and marks it present.
    #[must_use]
    pub const fn with_multiplicity(mut self, multiplicity: i32) -> Self {
        self.multiplicity = multiplicity;
        self.set_mask |= ResponseAttribute::Multiplicity.bit();
        self
    }

    /// Sets the send interval (ms) and marks it present.
    #[must_use]
    pub const fn with_send_interval_ms(mut self, send_interval_ms: i32) -> Self {
        self.send_interval_ms = send_interval_ms;
        self.set_mask |= ResponseAttribute::SendIntervalMs.bit();
        self
    }

    /// Sets the maximum session duration (ms) and marks it present.
    #[must_use]
    pub const fn with_max_session_duration_ms(mut self, duration_ms: i32) -> Self {
        self.max_session_duration_ms = duration_ms;
        self.set_mask |= ResponseAttribute::MaxSessionDurationMs.bit();
        self
    }

    /// Sets the maximum events per session and marks it present.
    #[must_use]
    pub const fn with_max_events_per_session(mut self, max_events: i32) -> Self {
        self.max_events_per_session = max_events;
        self.set_mask |= ResponseAttribute::MaxEventsPerSession.bit();
        self
    }

    /// Sets the idle timeout (ms) and marks it present.
    #[must_use]
    pub const fn with_session_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.session_timeout_ms = timeout_ms;
        self.set_mask |= ResponseAttribute::SessionTimeoutMs.bit();
        self
    }

    /// Sets the visit-store version and marks it present.
    #[must_use]
    pub const fn with_visit_store_version(mut self, version: i32) -> Self {
        self.visit_store_version = version;
        self.set_mask |= ResponseAttribute::VisitStoreVersion.bit();
        self
    }

    /// Sets the traffic control percentage and marks it present.
    #[must_use]
    pub const fn with_traffic_control_percentage(mut self, percentage: i32) -> Self {
        self.traffic_control_percentage = percentage;
        self.set_mask |= ResponseAttribute::TrafficControlPercentage.bit();
        self
    }

    /// Sets the server timestamp (ms) and marks it present.
    #[must_use]
    pub const fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self.set_mask |= ResponseAttribute::TimestampMs.bit();
        self
    }
}
