//! Core protocol types: priorities, request lifecycle, scan records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Maximum advertisement records kept per device in the scan cache.
pub const MAX_HISTORY_PER_DEVICE: usize = 10;

/// Priority of a queued request. Lower numeric value dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum RequestPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Default for RequestPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl RequestPriority {
    /// Parse a priority from its wire spelling (`"HIGH"`, `"NORMAL"`, `"LOW"`).
    ///
    /// Returns `None` for unknown spellings; callers decide whether to
    /// reject or fall back to [`RequestPriority::Normal`].
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "HIGH" => Some(Self::High),
            "NORMAL" => Some(Self::Normal),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }

    /// The wire spelling of this priority.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        }
    }
}

impl std::fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Lifecycle status of a request.
///
/// Status progresses strictly `Pending` → `Processing` → one of the
/// terminal states. Terminal states are never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl RequestStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Processing | Self::Failed | Self::Timeout
            ),
            Self::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

/// One scan observation of a device, as reported to clients.
///
/// Immutable once constructed. `timestamp` is seconds since the Unix
/// epoch; the cache separately tracks a monotonic observation instant
/// for TTL purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Canonical MAC address (upper-case, colon-separated).
    pub address: String,
    /// Advertised local name, if any.
    #[serde(default)]
    pub name: Option<String>,
    /// Signal strength in dBm.
    #[serde(default)]
    pub rssi: Option<i16>,
    /// Manufacturer data keyed by 16-bit company id (four lowercase hex digits).
    #[serde(default)]
    pub manufacturer_data: BTreeMap<String, Vec<u8>>,
    /// Advertised service UUIDs.
    #[serde(default)]
    pub service_uuids: Vec<String>,
    /// Raw advertisement payload, opaque to the orchestrator.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Observation time, seconds since the Unix epoch.
    pub timestamp: f64,
}

impl ScanRecord {
    /// Format a 16-bit company id the way `manufacturer_data` keys it.
    pub fn company_key(company_id: u16) -> String {
        format!("{company_id:04x}")
    }
}

/// Scheduler counters surfaced through `get_service_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub skipped_requests: u64,
    pub processing_requests: u64,
}

/// Snapshot returned by the `get_service_status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusReport {
    pub is_running: bool,
    /// `"ok"` while the connect path is healthy, `"warning"` after
    /// consecutive failures, `"recovering"` while the watchdog acts.
    pub adapter_status: String,
    pub queue_size: usize,
    pub uptime_sec: f64,
    /// Devices with unexpired scan-cache entries.
    pub active_devices: usize,
    pub active_subscriptions: usize,
    pub exclusive_control_enabled: bool,
    pub stats: QueueStats,
}

/// Normalize a MAC address to canonical form: six upper-case hex bytes
/// separated by colons.
///
/// Accepts colon- or dash-separated input as well as a bare 12-digit hex
/// string.
///
/// # Example
///
/// ```
/// use orchestrator_types::normalize_mac;
///
/// assert_eq!(normalize_mac("aa:bb:cc:dd:ee:01").unwrap(), "AA:BB:CC:DD:EE:01");
/// assert_eq!(normalize_mac("AABBCCDDEE01").unwrap(), "AA:BB:CC:DD:EE:01");
/// ```
pub fn normalize_mac(input: &str) -> Result<String, ParseError> {
    let hexdigits: String = input
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    if hexdigits.len() != 12 || !hexdigits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidMac(input.to_string()));
    }

    let upper = hexdigits.to_ascii_uppercase();
    let mut out = String::with_capacity(17);
    for (i, chunk) in upper.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        // chunks of a 12-char ASCII string are valid UTF-8
        out.push_str(std::str::from_utf8(chunk).expect("ascii hex"));
    }
    Ok(out)
}
