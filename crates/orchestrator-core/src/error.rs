//! Error types for the orchestrator engine.
//!
//! The engine distinguishes operational errors (things a BLE stack does on
//! a bad day) from programmer errors (invariant violations, which panic in
//! debug builds and are never translated into client responses). Every
//! operational error maps onto exactly one user-visible reason string via
//! [`Error::reason`]; that string is what clients see in the `error` field
//! of a response frame.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by orchestrator operations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error
/// variants in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Requested MAC not present in the scan cache, or its entry expired.
    #[error("Device not found: {mac}")]
    DeviceNotFound { mac: String },

    /// Connect retries exhausted.
    #[error("Connection failed to {mac}: {reason}")]
    ConnectionFailed {
        mac: String,
        reason: ConnectionFailureReason,
    },

    /// A read or write returned a stack-level error.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Absolute request deadline elapsed.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Age-skip policy fired before any BLE work began.
    #[error("Request skipped due to age ({age_sec:.1}s > {max_age_sec:.1}s)")]
    SkippedDueToAge { age_sec: f64, max_age_sec: f64 },

    /// Backpressure rejection at the serial-lane watermark.
    #[error("Queue full ({queued} queued)")]
    QueueFull { queued: usize },

    /// Malformed frame, missing field, or unsupported command.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Adapter is in recovery; the client should retry later.
    #[error("Adapter unavailable: recovery in progress")]
    Unavailable,

    /// Operation cancelled through its token.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Connect-side adapter not available or powered off.
    AdapterUnavailable,
    /// Per-attempt connect timeout elapsed.
    Timeout,
    /// Device rejected the connection.
    Rejected,
    /// Stack-level BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "adapter unavailable"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::Rejected => write!(f, "connection rejected by device"),
            Self::BleError(msg) => write!(f, "BLE error: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error {
    /// Create a device-not-found error.
    pub fn device_not_found(mac: impl Into<String>) -> Self {
        Self::DeviceNotFound { mac: mac.into() }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure with a structured reason.
    pub fn connection_failed(mac: impl Into<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed {
            mac: mac.into(),
            reason,
        }
    }

    /// The user-visible reason string carried in response frames.
    ///
    /// Internal variants that must never reach a client verbatim
    /// (`Bluetooth`, `Io`, `Cancelled`, `InvalidConfig`) degrade to the
    /// nearest client-meaningful reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "DeviceNotFound",
            Self::ConnectionFailed { .. } => "ConnectionFailed",
            Self::OperationFailed(_) | Self::Bluetooth(_) => "OperationFailed",
            Self::Timeout { .. } | Self::Cancelled => "Timeout",
            Self::SkippedDueToAge { .. } => "SkippedDueToAge",
            Self::QueueFull { .. } => "QueueFull",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Unavailable => "Unavailable",
            Self::Io(_) | Self::InvalidConfig(_) => "Unavailable",
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bluetooth(_) => true,
            Self::ConnectionFailed { reason, .. } => matches!(
                reason,
                ConnectionFailureReason::Timeout
                    | ConnectionFailureReason::BleError(_)
                    | ConnectionFailureReason::Other(_)
            ),
            Self::Timeout { .. } => true,
            Self::Io(_) => true,
            Self::DeviceNotFound { .. }
            | Self::OperationFailed(_)
            | Self::SkippedDueToAge { .. }
            | Self::QueueFull { .. }
            | Self::InvalidRequest(_)
            | Self::Unavailable
            | Self::Cancelled
            | Self::InvalidConfig(_) => false,
        }
    }
}

impl From<orchestrator_types::ParseError> for Error {
    fn from(err: orchestrator_types::ParseError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// Result type alias using the engine's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings_match_taxonomy() {
        assert_eq!(Error::device_not_found("AA").reason(), "DeviceNotFound");
        assert_eq!(
            Error::connection_failed("AA", ConnectionFailureReason::Timeout).reason(),
            "ConnectionFailed"
        );
        assert_eq!(
            Error::OperationFailed("gatt".into()).reason(),
            "OperationFailed"
        );
        assert_eq!(
            Error::timeout("read", Duration::from_secs(10)).reason(),
            "Timeout"
        );
        assert_eq!(
            Error::SkippedDueToAge {
                age_sec: 40.0,
                max_age_sec: 30.0
            }
            .reason(),
            "SkippedDueToAge"
        );
        assert_eq!(Error::QueueFull { queued: 100 }.reason(), "QueueFull");
        assert_eq!(
            Error::InvalidRequest("missing field".into()).reason(),
            "InvalidRequest"
        );
        assert_eq!(Error::Unavailable.reason(), "Unavailable");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::timeout("connect", Duration::from_secs(1)).is_retryable());
        assert!(
            Error::connection_failed("AA", ConnectionFailureReason::Timeout).is_retryable()
        );
        assert!(
            !Error::connection_failed("AA", ConnectionFailureReason::Rejected).is_retryable()
        );
        assert!(!Error::device_not_found("AA").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::QueueFull { queued: 1 }.is_retryable());
    }

    #[test]
    fn test_display_contains_context() {
        let err = Error::connection_failed("AA:BB:CC:DD:EE:01", ConnectionFailureReason::Timeout);
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:01"));
        assert!(err.to_string().contains("timed out"));

        let err = Error::SkippedDueToAge {
            age_sec: 40.0,
            max_age_sec: 30.0,
        };
        assert!(err.to_string().contains("40.0"));
    }
}
