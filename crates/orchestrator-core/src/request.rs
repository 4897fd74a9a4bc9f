//! Typed requests flowing from the IPC boundary into the scheduler.
//!
//! The wire layer decodes frames into a closed set of [`Operation`]
//! variants; unknown shapes are rejected before they get here. Each
//! request carries its priority and an absolute deadline computed at
//! admission.

use std::time::Duration;

use tokio::time::Instant;

use orchestrator_types::{RequestPriority, RequestStatus};

use crate::error::Error;

/// What a request asks the orchestrator to do.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Return the newest cached advertisement for a device.
    CacheLookup { mac: String },
    /// Read a GATT characteristic.
    Read {
        mac: String,
        service_uuid: String,
        characteristic_uuid: String,
    },
    /// Write a GATT characteristic.
    Write {
        mac: String,
        service_uuid: String,
        characteristic_uuid: String,
        payload: Vec<u8>,
        wants_response: bool,
    },
    /// Open a notification subscription.
    Subscribe {
        mac: String,
        service_uuid: String,
        characteristic_uuid: String,
        callback_id: String,
        /// Inactivity timeout; zero means the subscription never expires.
        timeout: Duration,
    },
    /// Tear down a notification subscription.
    Unsubscribe { callback_id: String },
}

impl Operation {
    /// Whether this operation runs in the parallel cache-lookup lane.
    pub fn is_cache_lookup(&self) -> bool {
        matches!(self, Self::CacheLookup { .. })
    }

    /// The device this operation targets, if it targets one.
    pub fn mac(&self) -> Option<&str> {
        match self {
            Self::CacheLookup { mac }
            | Self::Read { mac, .. }
            | Self::Write { mac, .. }
            | Self::Subscribe { mac, .. } => Some(mac),
            Self::Unsubscribe { .. } => None,
        }
    }
}

/// One admitted request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Opaque unique id, echoed in the response.
    pub request_id: String,
    pub operation: Operation,
    pub priority: RequestPriority,
    /// Admission time (monotonic).
    pub created_at: Instant,
    /// Absolute deadline: `created_at + timeout`.
    pub deadline: Instant,
}

impl Request {
    /// Build a request admitted now with the given timeout.
    pub fn new(
        request_id: impl Into<String>,
        operation: Operation,
        priority: RequestPriority,
        timeout: Duration,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            request_id: request_id.into(),
            operation,
            priority,
            created_at,
            deadline: created_at + timeout,
        }
    }

    /// Age of this request.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time left until the deadline, zero if already past.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Terminal answer to one request. Exactly one is produced per admitted
/// request.
#[derive(Debug)]
pub struct Response {
    pub request_id: String,
    /// Always a terminal status.
    pub status: RequestStatus,
    pub result: Option<serde_json::Value>,
    /// Reason string from the error taxonomy, present unless `Completed`.
    pub error: Option<String>,
}

impl Response {
    pub fn completed(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: RequestStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: &Error) -> Self {
        let status = match error {
            Error::Timeout { .. } | Error::Cancelled => RequestStatus::Timeout,
            _ => RequestStatus::Failed,
        };
        Self {
            request_id: request_id.into(),
            status,
            result: None,
            error: Some(error.reason().to_string()),
        }
    }
}

/// Request status cell enforcing the strict lifecycle chain.
///
/// `Pending → Processing → terminal`; terminal states are final. An
/// illegal transition is a programmer error: it trips a debug assertion
/// and is refused in release builds.
#[derive(Debug)]
pub struct StatusCell(std::sync::Mutex<RequestStatus>);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(RequestStatus::Pending))
    }

    /// Current status.
    pub fn get(&self) -> RequestStatus {
        *self.0.lock().expect("status cell")
    }

    /// Attempt the transition to `next`. Returns whether it was legal.
    pub fn advance(&self, next: RequestStatus) -> bool {
        let mut status = self.0.lock().expect("status cell");
        if status.can_transition_to(next) {
            *status = next;
            true
        } else {
            debug_assert!(
                false,
                "illegal status transition {:?} -> {:?}",
                *status, next
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_derivation() {
        let request = Request::new(
            "r1",
            Operation::CacheLookup {
                mac: "AA:BB:CC:DD:EE:01".into(),
            },
            RequestPriority::Normal,
            Duration::from_secs(10),
        );
        assert_eq!(request.deadline - request.created_at, Duration::from_secs(10));
        assert!(request.remaining() <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_response_status_mapping() {
        let ok = Response::completed("r1", serde_json::json!({}));
        assert_eq!(ok.status, RequestStatus::Completed);
        assert!(ok.error.is_none());

        let timeout = Response::failed(
            "r2",
            &Error::timeout("read", Duration::from_secs(10)),
        );
        assert_eq!(timeout.status, RequestStatus::Timeout);
        assert_eq!(timeout.error.as_deref(), Some("Timeout"));

        let failed = Response::failed("r3", &Error::device_not_found("AA"));
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("DeviceNotFound"));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "illegal status transition"))]
    fn test_status_cell_rejects_terminal_mutation() {
        let cell = StatusCell::new();
        assert!(cell.advance(RequestStatus::Processing));
        assert!(cell.advance(RequestStatus::Completed));
        // Terminal states are final.
        let _ = cell.advance(RequestStatus::Failed);
        #[cfg(not(debug_assertions))]
        assert_eq!(cell.get(), RequestStatus::Completed);
    }

    #[test]
    fn test_operation_lane_routing() {
        assert!(
            Operation::CacheLookup {
                mac: "AA".into()
            }
            .is_cache_lookup()
        );
        assert!(
            !Operation::Unsubscribe {
                callback_id: "cb".into()
            }
            .is_cache_lookup()
        );
    }
}
