//! Transport error types.

use thiserror::Error;

/// Errors raised while constructing or driving the HTTP transport.
///
/// Request-level failures never escape the transport as errors; they are
/// folded into the sentinel response so the sender's state machine only ever
/// sees response codes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying HTTP client could not be initialized.
    #[error("failed to initialize HTTP client: {message}")]
    ClientInit {
        /// Description from the HTTP library.
        message: String,
    },

    /// The configured base URL is unusable.
    #[error("invalid beacon base URL {url:?}: {reason}")]
    InvalidBaseUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Compressing a beacon body failed.
    #[error("failed to gzip beacon body: {0}")]
    Compression(#[from] std::io::Error),
}
