//! Daemon configuration from environment variables.
//!
//! All variables are optional; unset or unparseable values fall back to
//! the defaults with a warning rather than refusing to start. Validation
//! of the assembled configuration still runs so that nonsensical values
//! (a zero timeout, an empty adapter name) are caught before components
//! spin up.

use std::time::Duration;

use tracing::warn;

/// Default Unix socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ble-orchestrator.sock";
/// Default TCP bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default TCP bind port ("BLE" on a phone keypad is 253; 8378 spells BEST).
pub const DEFAULT_PORT: u16 = 8378;

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// IPC socket path (Unix domain socket mode).
    pub socket_path: String,
    /// TCP bind host (TCP mode).
    pub host: String,
    /// TCP bind port (TCP mode).
    pub port: u16,
    /// Serve over loopback TCP instead of the Unix socket.
    pub use_tcp: bool,
    /// Maximum concurrent IPC sessions.
    pub max_sessions: usize,

    /// Scan-side adapter id (e.g. `hci0`).
    pub scan_adapter: String,
    /// Connect-side adapter id (e.g. `hci1`).
    pub connect_adapter: String,

    /// Scan cache TTL.
    pub scan_cache_ttl: Duration,
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Connect retry count.
    pub retry_count: u32,
    /// Delay between connect retries.
    pub retry_interval: Duration,

    /// Age above which a dequeued request is skipped.
    pub request_max_age: Duration,
    /// Whether the age-skip policy is active.
    pub skip_old_requests: bool,
    /// Default per-request deadline when the client gives none.
    pub default_request_timeout: Duration,
    /// Soft watermark on the serial queue; above it LOW enqueues are
    /// rejected with `QueueFull`.
    pub serial_queue_watermark: usize,

    /// Whether the scanner/client exclusive-control coordinator is active.
    pub exclusive_control_enabled: bool,
    /// Epoch age above which the deadlock probe fires.
    pub exclusive_control_timeout: Duration,

    /// Watchdog check period.
    pub watchdog_interval: Duration,
    /// Consecutive connect failures that trigger recovery.
    pub failure_threshold: u32,
    /// Cooldown after a skipped (unprivileged) recovery step.
    pub recovery_cooldown: Duration,

    /// Worker count of the cache-lookup lane.
    pub parallel_workers: usize,
    /// Per-request deadline in the cache-lookup lane.
    pub parallel_lane_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            use_tcp: false,
            max_sessions: 10,
            scan_adapter: "hci0".to_string(),
            connect_adapter: "hci1".to_string(),
            scan_cache_ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            retry_count: 2,
            retry_interval: Duration::from_secs(1),
            request_max_age: Duration::from_secs(30),
            skip_old_requests: true,
            default_request_timeout: Duration::from_secs(10),
            serial_queue_watermark: 100,
            exclusive_control_enabled: true,
            exclusive_control_timeout: Duration::from_secs(90),
            watchdog_interval: Duration::from_secs(30),
            failure_threshold: 3,
            recovery_cooldown: Duration::from_secs(60),
            parallel_workers: 3,
            parallel_lane_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Assemble configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            socket_path: env_string("SOCKET", defaults.socket_path),
            host: env_string("HOST", defaults.host),
            port: env_parsed("PORT", defaults.port),
            use_tcp: std::env::var_os("TCP").is_some(),
            max_sessions: env_parsed("MAX_SESSIONS", defaults.max_sessions),
            scan_adapter: env_string("SCAN_ADAPTER", defaults.scan_adapter),
            connect_adapter: env_string("CONNECT_ADAPTER", defaults.connect_adapter),
            scan_cache_ttl: env_secs("SCAN_CACHE_TTL_SEC", defaults.scan_cache_ttl),
            connect_timeout: env_secs("BLE_CONNECT_TIMEOUT_SEC", defaults.connect_timeout),
            retry_count: env_parsed("BLE_RETRY_COUNT", defaults.retry_count),
            retry_interval: env_secs("BLE_RETRY_INTERVAL_SEC", defaults.retry_interval),
            request_max_age: env_secs("REQUEST_MAX_AGE_SEC", defaults.request_max_age),
            skip_old_requests: env_bool("SKIP_OLD_REQUESTS", defaults.skip_old_requests),
            default_request_timeout: env_secs(
                "DEFAULT_REQUEST_TIMEOUT_SEC",
                defaults.default_request_timeout,
            ),
            serial_queue_watermark: env_parsed(
                "SERIAL_QUEUE_WATERMARK",
                defaults.serial_queue_watermark,
            ),
            exclusive_control_enabled: env_bool(
                "EXCLUSIVE_CONTROL_ENABLED",
                defaults.exclusive_control_enabled,
            ),
            exclusive_control_timeout: env_secs(
                "EXCLUSIVE_CONTROL_TIMEOUT_SEC",
                defaults.exclusive_control_timeout,
            ),
            watchdog_interval: env_secs("WATCHDOG_CHECK_INTERVAL_SEC", defaults.watchdog_interval),
            failure_threshold: env_parsed(
                "CONSECUTIVE_FAILURES_THRESHOLD",
                defaults.failure_threshold,
            ),
            recovery_cooldown: env_secs("RECOVERY_COOLDOWN_SEC", defaults.recovery_cooldown),
            parallel_workers: env_parsed(
                "SCAN_COMMAND_PARALLEL_WORKERS",
                defaults.parallel_workers,
            ),
            parallel_lane_timeout: env_secs(
                "SCAN_COMMAND_TIMEOUT_SEC",
                defaults.parallel_lane_timeout,
            ),
        }
    }

    /// Validate the assembled configuration.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !self.use_tcp && self.socket_path.is_empty() {
            errors.push(ValidationError::new("socket_path", "cannot be empty"));
        }
        if self.use_tcp && self.port == 0 {
            errors.push(ValidationError::new("port", "cannot be 0"));
        }
        if self.scan_adapter.is_empty() {
            errors.push(ValidationError::new("scan_adapter", "cannot be empty"));
        }
        if self.connect_adapter.is_empty() {
            errors.push(ValidationError::new("connect_adapter", "cannot be empty"));
        }
        if self.scan_cache_ttl.is_zero() {
            errors.push(ValidationError::new("scan_cache_ttl", "must be positive"));
        }
        if self.connect_timeout.is_zero() {
            errors.push(ValidationError::new("connect_timeout", "must be positive"));
        }
        if self.max_sessions == 0 {
            errors.push(ValidationError::new("max_sessions", "must be at least 1"));
        }
        if self.parallel_workers == 0 {
            errors.push(ValidationError::new("parallel_workers", "must be at least 1"));
        }
        if self.failure_threshold == 0 {
            errors.push(ValidationError::new(
                "failure_threshold",
                "must be at least 1",
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// A single validation error with its field path.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn env_string(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default,
    }
}

fn env_parsed<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("{name}={value} is not valid, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(value) => match value.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => Duration::from_secs_f64(secs),
            _ => {
                warn!(
                    "{name}={value} is not a valid duration, using default {:?}",
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
