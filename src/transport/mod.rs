//! Stateless HTTP request/response adapter for the monitoring backend.
//!
//! Three request kinds exist: STATUS (GET, configuration probe),
//! NEW_SESSION (GET) and BEACON (POST with a gzip-compressed body of
//! extracted chunks). The transport is abstracted behind the
//! [`BeaconTransport`] trait so the sender can be driven against a mock in
//! tests, in the same way production code uses [`HttpTransport`].
//!
//! # Failure model
//!
//! A transport never returns an error for an individual request. Connect or
//! write failures are retried up to a small bound when the HTTP library
//! signals retry-eligibility; exhaustion (or a non-retryable failure) yields
//! the *sentinel* response whose code is `i32::MAX`. Legitimate HTTP error
//! codes (4xx/5xx) pass through unchanged. Codes outside `[100, 599]` are
//! by definition not real HTTP and are treated as transport-sentinel.

pub mod error;
pub mod http;

pub use error::TransportError;
pub use http::HttpTransport;

/// Response code marking a transport-level failure (not an HTTP status).
pub const TRANSPORT_FAILURE_CODE: i32 = i32::MAX;

/// Inclusive range of response codes considered real HTTP statuses.
const HTTP_CODE_RANGE: std::ops::RangeInclusive<i32> = 100..=599;

/// The kind of request being sent, determining path shape and method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Periodic configuration probe (GET, no body).
    Status,
    /// Initial request announcing a new session (GET, no body).
    NewSession,
    /// Beacon payload transmission (POST, gzip body).
    Beacon,
}

impl RequestKind {
    /// Returns a short name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::NewSession => "NEW_SESSION",
            Self::Beacon => "BEACON",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw response from the backend: status code plus unparsed body.
///
/// Parsing into [`ResponseAttributes`](crate::protocol::ResponseAttributes)
/// happens one layer up, in the sender, so that parse-failure fallbacks and
/// capture policy stay out of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code, or [`TRANSPORT_FAILURE_CODE`].
    pub code: i32,
    /// Raw response body (empty on transport failure).
    pub body: String,
}

impl RawResponse {
    /// The sentinel response produced when the transport gives up.
    #[must_use]
    pub const fn transport_failure() -> Self {
        Self {
            code: TRANSPORT_FAILURE_CODE,
            body: String::new(),
        }
    }

    /// Returns whether this is the transport-failure sentinel (any code
    /// outside the real HTTP range).
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        !HTTP_CODE_RANGE.contains(&self.code)
    }

    /// Returns whether the backend accepted the request.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code == 200
    }

    /// Returns whether the response is unusable: either the sentinel or a
    /// real HTTP error code.
    #[must_use]
    pub fn is_erroneous(&self) -> bool {
        !self.is_ok()
    }
}

/// Adapter sending requests to the monitoring backend.
///
/// Implementations must be stateless with respect to sessions; all per-
/// session state lives in the sender and its sessions.
pub trait BeaconTransport: Send + Sync {
    /// Sends a STATUS configuration probe.
    fn send_status_request(&self, server_id: i32) -> RawResponse;

    /// Sends a NEW_SESSION announcement.
    fn send_new_session_request(&self, server_id: i32) -> RawResponse;

    /// Sends one beacon payload (already chunk-extracted wire data).
    fn send_beacon(&self, server_id: i32, beacon_data: &str) -> RawResponse;
}
