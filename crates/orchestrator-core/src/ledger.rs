//! Failure ledger: counters the watchdog reads to decide on recovery.
//!
//! Written by the request handler on every connect outcome, read by the
//! watchdog on its tick. Writes are commutative counter updates, so plain
//! atomics with a small mutex for the timestamps suffice.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::time::Instant;

/// Consecutive-failure accounting for the connect path.
#[derive(Debug, Default)]
pub struct FailureLedger {
    consecutive_connect_failures: AtomicU32,
    timestamps: Mutex<Timestamps>,
}

#[derive(Debug, Default)]
struct Timestamps {
    last_failure: Option<Instant>,
    last_reset: Option<Instant>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exhausted connect ladder. Returns the new streak length.
    pub fn record_connect_failure(&self) -> u32 {
        let streak = self
            .consecutive_connect_failures
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        self.timestamps.lock().expect("ledger timestamps").last_failure = Some(Instant::now());
        streak
    }

    /// Record a successful connect: the streak resets to exactly zero.
    pub fn record_connect_success(&self) {
        self.consecutive_connect_failures.store(0, Ordering::SeqCst);
    }

    /// Watchdog reset after a recovery action.
    pub fn reset_after_recovery(&self) {
        self.consecutive_connect_failures.store(0, Ordering::SeqCst);
        self.timestamps.lock().expect("ledger timestamps").last_reset = Some(Instant::now());
    }

    /// Current consecutive connect failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_connect_failures.load(Ordering::SeqCst)
    }

    /// When the most recent failure was recorded.
    pub fn last_failure(&self) -> Option<Instant> {
        self.timestamps.lock().expect("ledger timestamps").last_failure
    }

    /// When the watchdog last reset the ledger.
    pub fn last_reset(&self) -> Option<Instant> {
        self.timestamps.lock().expect("ledger timestamps").last_reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_are_monotonic_until_reset() {
        let ledger = FailureLedger::new();
        assert_eq!(ledger.consecutive_failures(), 0);

        assert_eq!(ledger.record_connect_failure(), 1);
        assert_eq!(ledger.record_connect_failure(), 2);
        assert_eq!(ledger.record_connect_failure(), 3);
        assert!(ledger.last_failure().is_some());

        ledger.record_connect_success();
        assert_eq!(ledger.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_recovery_reset_stamps_time() {
        let ledger = FailureLedger::new();
        ledger.record_connect_failure();
        assert!(ledger.last_reset().is_none());

        ledger.reset_after_recovery();
        assert_eq!(ledger.consecutive_failures(), 0);
        assert!(ledger.last_reset().is_some());
    }
}
