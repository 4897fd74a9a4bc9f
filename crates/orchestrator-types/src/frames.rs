//! Line-delimited JSON frames spoken on the IPC boundary.
//!
//! Every message is exactly one JSON object per LF-terminated line.
//! Incoming frames decode into [`CommandFrame`]; the daemon answers with
//! [`ResponseFrame`]s and pushes [`NotificationFrame`]s to subscribers.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A decoded client command.
///
/// Unknown `command` values fail deserialization; the server maps that to
/// an `InvalidRequest` error frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandFrame {
    /// Look up the newest cached scan record for a device.
    ScanCommand {
        mac_address: String,
        request_id: String,
    },
    /// Read a GATT characteristic.
    ReadCommand {
        mac_address: String,
        service_uuid: String,
        characteristic_uuid: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },
    /// Write a GATT characteristic.
    SendCommand {
        mac_address: String,
        service_uuid: String,
        characteristic_uuid: String,
        data: WritePayload,
        request_id: String,
        #[serde(default)]
        response_required: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },
    /// Subscribe to characteristic notifications.
    SubscribeNotifications {
        mac_address: String,
        service_uuid: String,
        characteristic_uuid: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
        /// Inactivity timeout in seconds. Zero (the default) means the
        /// subscription only ends on explicit unsubscribe or session close.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notification_timeout: Option<f64>,
    },
    /// Tear down a subscription by callback id.
    UnsubscribeNotifications {
        callback_id: String,
        request_id: String,
    },
    /// Report daemon health and queue counters.
    GetServiceStatus { request_id: String },
}

impl CommandFrame {
    /// The request id carried by this frame.
    pub fn request_id(&self) -> &str {
        match self {
            Self::ScanCommand { request_id, .. }
            | Self::ReadCommand { request_id, .. }
            | Self::SendCommand { request_id, .. }
            | Self::SubscribeNotifications { request_id, .. }
            | Self::UnsubscribeNotifications { request_id, .. }
            | Self::GetServiceStatus { request_id } => request_id,
        }
    }
}

/// Write payload accepted in either wire form: a hex string (with or
/// without a `0x` prefix) or an array of integers 0–255.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WritePayload {
    Hex(String),
    Bytes(Vec<u8>),
}

impl WritePayload {
    /// Decode the payload into raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Hex(text) => {
                let stripped = text
                    .trim()
                    .strip_prefix("0x")
                    .or_else(|| text.trim().strip_prefix("0X"))
                    .unwrap_or_else(|| text.trim());
                hex::decode(stripped)
                    .map_err(|e| ParseError::InvalidPayload(format!("bad hex data: {e}")))
            }
        }
    }
}

/// A response to one command frame. Exactly one is emitted per accepted
/// request unless the session is already gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResponseFrame {
    Success {
        request_id: String,
        result: serde_json::Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
}

impl ResponseFrame {
    /// Build a success frame.
    pub fn success(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::Success {
            request_id: request_id.into(),
            result,
        }
    }

    /// Build an error frame bound to a request id.
    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            request_id: Some(request_id.into()),
            error: error.into(),
        }
    }

    /// Build an error frame for a frame whose request id could not be read.
    pub fn anonymous_error(error: impl Into<String>) -> Self {
        Self::Error {
            request_id: None,
            error: error.into(),
        }
    }
}

/// A pushed characteristic notification. Not a response to any frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationFrame {
    /// Always `"notification"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub callback_id: String,
    pub mac_address: String,
    pub characteristic_uuid: String,
    pub value: Vec<u8>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl NotificationFrame {
    pub fn new(
        callback_id: impl Into<String>,
        mac_address: impl Into<String>,
        characteristic_uuid: impl Into<String>,
        value: Vec<u8>,
        timestamp: f64,
    ) -> Self {
        Self {
            kind: "notification".to_string(),
            callback_id: callback_id.into(),
            mac_address: mac_address.into(),
            characteristic_uuid: characteristic_uuid.into(),
            value,
            timestamp,
        }
    }
}
