//! Agent and server configuration value types.
//!
//! Two configuration layers exist:
//!
//! - [`AgentConfiguration`]: host-supplied, fixed for the lifetime of the
//!   agent (endpoint, identities, cache bounds, privacy level).
//! - [`ServerConfiguration`]: server-dictated, immutable snapshots derived
//!   from parsed [`ResponseAttributes`](crate::protocol::ResponseAttributes)
//!   and swapped atomically per session as responses arrive.
//!
//! # Merge semantics
//!
//! [`ServerConfiguration::merge`] is deliberately asymmetric: capture flags
//! and the send interval follow the latest response, while session-identity
//! and session-splitting fields (`multiplicity`, `server_id`, the three split
//! thresholds, `visit_store_version`, `traffic_control_percentage`) are
//! pinned to the values from the session's first server contact. A later
//! response therefore never silently changes the split cadence of a running
//! session.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::protocol::{ResponseAttribute, ResponseAttributes};

/// Privacy level controlling which event kinds are recorded at all and
/// whether identifying fields are included on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataCollectionLevel {
    /// Record nothing.
    Off,
    /// Record actions, errors, crashes and web requests, without
    /// identifying fields.
    Performance,
    /// Record everything, including values, named events, user
    /// identification and identifying fields.
    #[default]
    UserBehavior,
}

impl DataCollectionLevel {
    /// Whether performance-class events (actions, errors, crashes, web
    /// requests) may be recorded.
    #[must_use]
    pub const fn allows_performance_events(self) -> bool {
        matches!(self, Self::Performance | Self::UserBehavior)
    }

    /// Whether behavior-class events (named events, reported values, user
    /// identification) may be recorded.
    #[must_use]
    pub const fn allows_behavior_events(self) -> bool {
        matches!(self, Self::UserBehavior)
    }

    /// Whether identifying fields (device id, session number, free-form
    /// values) may be put on the wire.
    #[must_use]
    pub const fn allows_identifying_fields(self) -> bool {
        matches!(self, Self::UserBehavior)
    }
}

/// Host-supplied agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfiguration {
    /// Base URL of the monitoring backend.
    pub base_url: String,
    /// Application identifier assigned by the backend.
    pub application_id: String,
    /// Device identifier of this installation.
    pub device_id: i64,
    /// Privacy level for recorded data.
    #[serde(default)]
    pub data_collection_level: DataCollectionLevel,
    /// Maximum age of a cached record before eviction, in milliseconds.
    #[serde(default = "default_max_record_age_ms")]
    pub max_record_age_ms: i64,
    /// Cache size at which space eviction starts, in bytes.
    #[serde(default = "default_cache_size_upper_bound")]
    pub cache_size_upper_bound_bytes: u64,
    /// Cache size space eviction shrinks down to, in bytes.
    #[serde(default = "default_cache_size_lower_bound")]
    pub cache_size_lower_bound_bytes: u64,
    /// HTTP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

const fn default_max_record_age_ms() -> i64 {
    105 * 60 * 1000
}
const fn default_cache_size_upper_bound() -> u64 {
    100 * 1024 * 1024
}
const fn default_cache_size_lower_bound() -> u64 {
    80 * 1024 * 1024
}
const fn default_connect_timeout_ms() -> u64 {
    5_000
}
const fn default_request_timeout_ms() -> u64 {
    30_000
}

impl AgentConfiguration {
    /// Creates a configuration with default tuning for the given endpoint
    /// and identities.
    #[must_use]
    pub fn new(base_url: impl Into<String>, application_id: impl Into<String>, device_id: i64) -> Self {
        Self {
            base_url: base_url.into(),
            application_id: application_id.into(),
            device_id,
            data_collection_level: DataCollectionLevel::default(),
            max_record_age_ms: default_max_record_age_ms(),
            cache_size_upper_bound_bytes: default_cache_size_upper_bound(),
            cache_size_lower_bound_bytes: default_cache_size_lower_bound(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    /// Sets the data collection level.
    #[must_use]
    pub const fn with_data_collection_level(mut self, level: DataCollectionLevel) -> Self {
        self.data_collection_level = level;
        self
    }

    /// Sets the cache eviction bounds.
    #[must_use]
    pub const fn with_cache_bounds(mut self, lower_bytes: u64, upper_bytes: u64) -> Self {
        self.cache_size_lower_bound_bytes = lower_bytes;
        self.cache_size_upper_bound_bytes = upper_bytes;
        self
    }

    /// Sets the maximum cached record age in milliseconds.
    #[must_use]
    pub const fn with_max_record_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_record_age_ms = max_age_ms;
        self
    }
}

/// Immutable server-dictated configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    /// Whether the backend wants any data.
    pub capture_enabled: bool,
    /// Whether crash reports are wanted.
    pub crash_reporting_enabled: bool,
    /// Whether error reports are wanted.
    pub error_reporting_enabled: bool,
    /// Server id to address requests to.
    pub server_id: i32,
    /// Maximum beacon payload size in bytes.
    pub beacon_size_bytes: i32,
    /// Sampling multiplicity.
    pub multiplicity: i32,
    /// Interval between send cycles in milliseconds.
    pub send_interval_ms: i32,
    /// Maximum session duration before splitting, in milliseconds.
    pub max_session_duration_ms: i32,
    /// Whether splitting by session duration was dictated.
    pub split_by_session_duration: bool,
    /// Maximum top-level events per session before splitting.
    pub max_events_per_session: i32,
    /// Whether splitting by event count was dictated.
    pub split_by_events: bool,
    /// Idle timeout before splitting, in milliseconds.
    pub session_timeout_ms: i32,
    /// Whether splitting by idle timeout was dictated.
    pub split_by_idle_timeout: bool,
    /// Backend visit-store schema version.
    pub visit_store_version: i32,
    /// Traffic control percentage (0-100).
    pub traffic_control_percentage: i32,
}

impl ServerConfiguration {
    /// Configuration in effect before any server contact.
    #[must_use]
    pub const fn undefined() -> Self {
        Self::from_attributes(&ResponseAttributes::undefined())
    }

    /// Builds a configuration from parsed response attributes.
    ///
    /// Split flags are derived from field presence: a threshold the server
    /// never mentioned does not enable splitting, regardless of the default
    /// profile's value.
    #[must_use]
    pub const fn from_attributes(attributes: &ResponseAttributes) -> Self {
        Self {
            capture_enabled: attributes.capture,
            crash_reporting_enabled: attributes.capture_crashes,
            error_reporting_enabled: attributes.capture_errors,
            server_id: attributes.server_id,
            beacon_size_bytes: attributes.beacon_size_bytes,
            multiplicity: attributes.multiplicity,
            send_interval_ms: attributes.send_interval_ms,
            max_session_duration_ms: attributes.max_session_duration_ms,
            split_by_session_duration: attributes
                .is_set(ResponseAttribute::MaxSessionDurationMs),
            max_events_per_session: attributes.max_events_per_session,
            split_by_events: attributes.is_set(ResponseAttribute::MaxEventsPerSession),
            session_timeout_ms: attributes.session_timeout_ms,
            split_by_idle_timeout: attributes.is_set(ResponseAttribute::SessionTimeoutMs),
            visit_store_version: attributes.visit_store_version,
            traffic_control_percentage: attributes.traffic_control_percentage,
        }
    }

    /// Merges an incoming configuration into this one.
    ///
    /// Every field is taken from `incoming` except the session-identity and
    /// session-splitting fields, which are retained from `self`:
    /// `multiplicity`, `server_id`, `max_session_duration_ms`,
    /// `max_events_per_session`, `session_timeout_ms`, `visit_store_version`
    /// and `traffic_control_percentage` (split flags travel with their
    /// thresholds).
    #[must_use]
    pub const fn merge(&self, incoming: &Self) -> Self {
        Self {
            // Live fields follow the incoming response.
            capture_enabled: incoming.capture_enabled,
            crash_reporting_enabled: incoming.crash_reporting_enabled,
            error_reporting_enabled: incoming.error_reporting_enabled,
            beacon_size_bytes: incoming.beacon_size_bytes,
            send_interval_ms: incoming.send_interval_ms,
            // Pinned fields keep the session's first-contact values.
            multiplicity: self.multiplicity,
            server_id: self.server_id,
            max_session_duration_ms: self.max_session_duration_ms,
            split_by_session_duration: self.split_by_session_duration,
            max_events_per_session: self.max_events_per_session,
            split_by_events: self.split_by_events,
            session_timeout_ms: self.session_timeout_ms,
            split_by_idle_timeout: self.split_by_idle_timeout,
            visit_store_version: self.visit_store_version,
            traffic_control_percentage: self.traffic_control_percentage,
        }
    }

    /// Returns a copy with the multiplicity replaced.
    #[must_use]
    pub const fn with_multiplicity(mut self, multiplicity: i32) -> Self {
        self.multiplicity = multiplicity;
        self
    }

    /// Whether any data may be sent: capture on and a positive multiplicity.
    #[must_use]
    pub const fn is_sending_data_allowed(&self) -> bool {
        self.capture_enabled && self.multiplicity > 0
    }

    /// Whether error reports may be sent.
    #[must_use]
    pub const fn is_sending_errors_allowed(&self) -> bool {
        self.is_sending_data_allowed() && self.error_reporting_enabled
    }

    /// Whether crash reports may be sent.
    #[must_use]
    pub const fn is_sending_crashes_allowed(&self) -> bool {
        self.is_sending_data_allowed() && self.crash_reporting_enabled
    }

    /// Whether splitting by event count is effective.
    #[must_use]
    pub const fn is_split_by_events_enabled(&self) -> bool {
        self.split_by_events && self.max_events_per_session > 0
    }

    /// Whether splitting by session duration is effective.
    #[must_use]
    pub const fn is_split_by_session_duration_enabled(&self) -> bool {
        self.split_by_session_duration && self.max_session_duration_ms > 0
    }

    /// Whether splitting by idle timeout is effective.
    #[must_use]
    pub const fn is_split_by_idle_timeout_enabled(&self) -> bool {
        self.split_by_idle_timeout && self.session_timeout_ms > 0
    }
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self::undefined()
    }
}

/// Thread-safe holder of one session's current server configuration.
///
/// The configuration itself is immutable; updates swap the inner `Arc`
/// under a short write lock, so readers never observe a partially-updated
/// configuration.
#[derive(Debug)]
pub struct ConfigurationSlot {
    inner: RwLock<Arc<ServerConfiguration>>,
}

impl ConfigurationSlot {
    /// Creates a slot holding the given configuration.
    #[must_use]
    pub fn new(config: ServerConfiguration) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Returns the current configuration snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<ServerConfiguration> {
        Arc::clone(
            &self
                .inner
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Replaces the current configuration.
    pub fn set(&self, config: ServerConfiguration) {
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(config);
    }

    /// Merges an incoming configuration into the current one under the
    /// write lock (see [`ServerConfiguration::merge`]) and returns the
    /// merged snapshot.
    pub fn merge_incoming(&self, incoming: &ServerConfiguration) -> Arc<ServerConfiguration> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let merged = Arc::new(guard.merge(incoming));
        *guard = Arc::clone(&merged);
        merged
    }

    /// Disables capture in the current configuration, keeping everything
    /// else unchanged. Buffered data is unaffected.
    pub fn disable_capture(&self) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut disabled = **guard;
        disabled.capture_enabled = false;
        *guard = Arc::new(disabled);
    }
}

impl Default for ConfigurationSlot {
    fn default() -> Self {
        Self::new(ServerConfiguration::undefined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_incoming() -> ServerConfiguration {
        ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults()
                .with_capture(false)
                .with_capture_crashes(false)
                .with_capture_errors(true)
                .with_server_id(42)
                .with_beacon_size_bytes(1_024)
                .with_multiplicity(9)
                .with_send_interval_ms(1_000)
                .with_max_session_duration_ms(50_000)
                .with_max_events_per_session(77)
                .with_session_timeout_ms(9_000)
                .with_visit_store_version(5)
                .with_traffic_control_percentage(10),
        )
    }

    #[test]
    fn test_undefined_configuration() {
        let config = ServerConfiguration::undefined();
        assert_eq!(config.server_id, -1);
        assert!(!config.split_by_events);
        assert!(!config.split_by_session_duration);
        assert!(!config.split_by_idle_timeout);
        assert!(config.capture_enabled);
        assert_eq!(config.multiplicity, 1);
    }

    #[test]
    fn test_split_flags_follow_presence_not_defaults() {
        // JSON default profile has positive thresholds, but absence on the
        // wire must leave splitting disabled.
        let config = ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults().with_capture(true),
        );
        assert_eq!(config.max_events_per_session, 200);
        assert!(!config.split_by_events);
        assert!(!config.is_split_by_events_enabled());
    }

    #[test]
    fn test_split_flag_requires_positive_threshold() {
        let config = ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults().with_max_events_per_session(0),
        );
        assert!(config.split_by_events);
        assert!(!config.is_split_by_events_enabled());

        let config = ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults().with_max_events_per_session(3),
        );
        assert!(config.is_split_by_events_enabled());
    }

    #[test]
    fn test_merge_retains_pinned_fields() {
        let current = ServerConfiguration::undefined();
        let incoming = sample_incoming();
        let merged = current.merge(&incoming);

        // Pinned: from current.
        assert_eq!(merged.multiplicity, current.multiplicity);
        assert_eq!(merged.server_id, current.server_id);
        assert_eq!(
            merged.max_session_duration_ms,
            current.max_session_duration_ms
        );
        assert_eq!(merged.max_events_per_session, current.max_events_per_session);
        assert_eq!(merged.session_timeout_ms, current.session_timeout_ms);
        assert_eq!(merged.visit_store_version, current.visit_store_version);
        assert_eq!(
            merged.traffic_control_percentage,
            current.traffic_control_percentage
        );
        assert_eq!(merged.split_by_events, current.split_by_events);
        assert_eq!(
            merged.split_by_session_duration,
            current.split_by_session_duration
        );
        assert_eq!(merged.split_by_idle_timeout, current.split_by_idle_timeout);

        // Live: from incoming.
        assert_eq!(merged.capture_enabled, incoming.capture_enabled);
        assert_eq!(
            merged.crash_reporting_enabled,
            incoming.crash_reporting_enabled
        );
        assert_eq!(
            merged.error_reporting_enabled,
            incoming.error_reporting_enabled
        );
        assert_eq!(merged.beacon_size_bytes, incoming.beacon_size_bytes);
        assert_eq!(merged.send_interval_ms, incoming.send_interval_ms);
    }

    #[test]
    fn test_merge_both_directions() {
        let a = sample_incoming();
        let b = ServerConfiguration::undefined();
        let merged = a.merge(&b);
        assert_eq!(merged.multiplicity, a.multiplicity);
        assert_eq!(merged.capture_enabled, b.capture_enabled);
    }

    #[test]
    fn test_sending_predicates() {
        let base = ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults()
                .with_capture(true)
                .with_multiplicity(1)
                .with_capture_errors(true)
                .with_capture_crashes(true),
        );
        assert!(base.is_sending_data_allowed());
        assert!(base.is_sending_errors_allowed());
        assert!(base.is_sending_crashes_allowed());

        let zero_multiplicity = base.with_multiplicity(0);
        assert!(!zero_multiplicity.is_sending_data_allowed());
        assert!(!zero_multiplicity.is_sending_errors_allowed());
        assert!(!zero_multiplicity.is_sending_crashes_allowed());

        let capture_off = ServerConfiguration::from_attributes(
            &ResponseAttributes::json_defaults().with_capture(false),
        );
        assert!(!capture_off.is_sending_data_allowed());
    }

    #[test]
    fn test_data_collection_level_gating() {
        assert!(!DataCollectionLevel::Off.allows_performance_events());
        assert!(!DataCollectionLevel::Off.allows_behavior_events());
        assert!(DataCollectionLevel::Performance.allows_performance_events());
        assert!(!DataCollectionLevel::Performance.allows_behavior_events());
        assert!(!DataCollectionLevel::Performance.allows_identifying_fields());
        assert!(DataCollectionLevel::UserBehavior.allows_performance_events());
        assert!(DataCollectionLevel::UserBehavior.allows_behavior_events());
        assert!(DataCollectionLevel::UserBehavior.allows_identifying_fields());
    }

    #[test]
    fn test_configuration_slot_swaps_snapshots() {
        let slot = ConfigurationSlot::default();
        assert_eq!(slot.get().server_id, -1);

        let incoming = sample_incoming();
        let merged = slot.merge_incoming(&incoming);
        // Pinned fields survive the merge, live fields follow incoming.
        assert_eq!(merged.server_id, -1);
        assert_eq!(merged.capture_enabled, incoming.capture_enabled);
        assert_eq!(slot.get().as_ref(), merged.as_ref());

        slot.disable_capture();
        assert!(!slot.get().capture_enabled);
        // Only the capture flag changed.
        assert_eq!(slot.get().beacon_size_bytes, merged.beacon_size_bytes);
    }

    #[test]
    fn test_agent_configuration_builder() {
        let config = AgentConfiguration::new("https://beacon.example.com/mbeacon", "app-1", 42)
            .with_data_collection_level(DataCollectionLevel::Performance)
            .with_cache_bounds(1_000, 2_000)
            .with_max_record_age_ms(60_000);
        assert_eq!(config.application_id, "app-1");
        assert_eq!(config.device_id, 42);
        assert_eq!(config.cache_size_lower_bound_bytes, 1_000);
        assert_eq!(config.cache_size_upper_bound_bytes, 2_000);
        assert_eq!(config.max_record_age_ms, 60_000);
    }
}
