//! Response parsing error types.

use thiserror::Error;

/// Errors produced by the response codec.
///
/// Parse failures never propagate to the instrumented application; the
/// sender maps them to the default attribute profile for the response shape.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The key-value grammar produced an odd token count, so keys and
    /// values cannot be paired.
    #[error("invalid key-value response: odd token count {token_count}")]
    InvalidKeyValueFormat {
        /// Number of `&`/`=`-separated tokens found.
        token_count: usize,
    },

    /// A key-value token carried a non-numeric value for a numeric key.
    #[error("invalid numeric value for key {key:?}: {value:?}")]
    InvalidNumericValue {
        /// The wire key.
        key: String,
        /// The offending value.
        value: String,
    },

    /// The JSON payload failed to parse.
    #[error("malformed JSON response: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload matched neither the key-value nor the JSON grammar.
    #[error("unsupported response format (starts with {prefix:?})")]
    UnsupportedFormat {
        /// The first few characters of the payload.
        prefix: String,
    },
}
