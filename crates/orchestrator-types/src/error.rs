//! Error types for wire-level parsing.

use thiserror::Error;

/// Errors produced while decoding client-supplied values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A MAC address did not have six hex-encoded bytes.
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    /// Write payload could not be decoded as hex or a byte array.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A frame field held a value outside its allowed set.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ParseError {
    /// Create an invalid-value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }
}

/// Result type alias using [`ParseError`].
pub type ParseResult<T> = std::result::Result<T, ParseError>;
