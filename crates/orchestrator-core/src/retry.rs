//! Retry logic for transient BLE failures.
//!
//! Connect attempts against a busy or flaky stack fail routinely; the
//! orchestrator retries them locally so clients only see errors once the
//! budget is exhausted. Non-retryable errors (device unknown, request
//! invalid, cancelled) short-circuit immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means a single try).
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Connect retries per the daemon configuration: `count` attempts at
    /// a fixed `interval`.
    pub fn for_connect(count: u32, interval: Duration) -> Self {
        Self {
            max_retries: count,
            initial_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
            ..Default::default()
        }
    }

    /// Patient exponential backoff for long-lived reconnect loops:
    /// 1 s doubling up to 30 s, with jitter so a fleet of subscriptions
    /// does not reconnect in lockstep.
    pub fn for_reconnect() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Scan-start backoff: 1 s doubling, capped at 30 s.
    pub fn for_scan_start() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let final_delay = if self.jitter {
            capped * (1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay)
    }
}

/// Execute an async operation with retry logic.
///
/// Retries only errors classified retryable by [`Error::is_retryable`];
/// returns the last error once the budget is spent.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{operation_name} succeeded after {attempt} retries");
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                last_error = Some(e);
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        "{operation_name} failed (attempt {}/{}), retrying in {:?}",
                        attempt + 1,
                        config.max_retries + 1,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or(Error::Cancelled))
}
