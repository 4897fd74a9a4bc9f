//! Watchdog: hang detection and the recovery ladder.
//!
//! The watchdog wakes on a fixed period and on failure signals from the
//! handler and scanner. When the consecutive-failure threshold is
//! reached (or the scanner reports a stall it cannot repair itself), it
//! walks the recovery ladder, stopping at the first step whose command
//! succeeds:
//!
//! 1. lightweight adapter down/up,
//! 2. full adapter reset,
//! 3. Bluetooth stack restart (counters reset here).
//!
//! The scanner is held paused through a coordinator epoch for the whole
//! ladder and rebuilt afterwards. A step that fails, typically for lack
//! of privileges, is logged and skipped, and the next step runs only
//! after a cooldown. The watchdog also owns the coordinator deadlock
//! probe: an epoch left open past the threshold is force-reset.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, SCAN_STOP_WAIT};
use crate::host::{AdapterState, HostControl};
use crate::ledger::FailureLedger;
use crate::scanner::ScannerHandle;

/// Failure signals consumed by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// A connect retry ladder was exhausted; `streak` is the running
    /// consecutive-failure count.
    ConnectFailure { streak: u32 },
    /// Scan starts keep failing despite backoff.
    ScanStartFailed { attempts: u32 },
    /// The scanner could not repair a stalled stack by itself.
    ScanStalled,
}

/// Settle times after each ladder step.
const LIGHTWEIGHT_RESET_WAIT: Duration = Duration::from_secs(2);
const FULL_RESET_WAIT: Duration = Duration::from_secs(5);
const STACK_RESTART_WAIT: Duration = Duration::from_secs(10);

/// Watchdog configuration distilled from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub check_interval: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub connect_adapter: String,
    pub scan_adapter: String,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            connect_adapter: "hci1".to_string(),
            scan_adapter: "hci0".to_string(),
        }
    }
}

/// The recovery watchdog task.
pub struct Watchdog {
    options: WatchdogOptions,
    ledger: Arc<FailureLedger>,
    coordinator: Arc<Coordinator>,
    host: Arc<dyn HostControl>,
    scanner: ScannerHandle,
    signals: mpsc::UnboundedReceiver<FailureSignal>,
    recovering: Arc<AtomicBool>,
    started_at: Instant,
}

impl Watchdog {
    pub fn new(
        options: WatchdogOptions,
        ledger: Arc<FailureLedger>,
        coordinator: Arc<Coordinator>,
        host: Arc<dyn HostControl>,
        scanner: ScannerHandle,
        signals: mpsc::UnboundedReceiver<FailureSignal>,
    ) -> Self {
        Self {
            options,
            ledger,
            coordinator,
            host,
            scanner,
            signals,
            recovering: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    /// Flag other components read to answer "is the adapter usable".
    pub fn recovering_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.recovering)
    }

    /// Spawn the watchdog task. Runs until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!("watchdog started");
        let mut tick = tokio::time::interval(self.options.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                signal = self.signals.recv() => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => break,
                },

                _ = tick.tick() => self.on_tick().await,
            }
        }
        info!("watchdog stopped");
    }

    async fn on_tick(&self) {
        let failures = self.ledger.consecutive_failures();
        debug!(
            uptime_sec = self.started_at.elapsed().as_secs(),
            consecutive_failures = failures,
            "watchdog heartbeat"
        );

        // Deadlock probe: an epoch held open past the threshold means a
        // client operation is stuck; release the scanner.
        if self.coordinator.probe_deadlock() {
            self.coordinator.force_reset();
        }

        if failures >= self.options.failure_threshold {
            warn!(
                failures,
                "consecutive connect failures over threshold, starting recovery"
            );
            self.run_recovery(false).await;
            return;
        }

        // Scanner-side health: a scan adapter that is not up and running
        // warrants the full ladder. Status probes that themselves fail
        // (missing privileges, missing tool) are not treated as a fault.
        match self.host.adapter_status(&self.options.scan_adapter).await {
            Ok(AdapterState::UpRunning) | Err(_) => {}
            Ok(state) => {
                warn!(?state, adapter = %self.options.scan_adapter, "scan adapter unhealthy");
                self.run_recovery(false).await;
            }
        }
    }

    async fn on_signal(&self, signal: FailureSignal) {
        match signal {
            FailureSignal::ConnectFailure { streak } => {
                if streak >= self.options.failure_threshold {
                    info!(streak, "connect-failure signal over threshold");
                    // Connect failures usually clear with the adapter
                    // bounce alone; run only the lightweight path first.
                    self.run_recovery(true).await;
                }
            }
            FailureSignal::ScanStartFailed { attempts } => {
                warn!(attempts, "scan-start failure signal");
                self.run_recovery(false).await;
            }
            FailureSignal::ScanStalled => {
                warn!("scan-stall signal");
                self.run_recovery(false).await;
            }
        }
    }

    /// Walk the recovery ladder, stopping at the first step whose
    /// command succeeds. `lightweight_only` restricts to step one.
    async fn run_recovery(&self, lightweight_only: bool) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            debug!("recovery already in progress");
            return;
        }

        // Keep the scanner off the adapter for the duration.
        self.coordinator.request_pause();
        self.coordinator.wait_scan_stopped(SCAN_STOP_WAIT).await;

        let outcome = self.ladder(lightweight_only).await;
        if let Err(step) = outcome {
            error!(step, "recovery ladder exhausted without a successful step");
        }

        self.coordinator.notify_done();
        self.scanner.request_recreate();
        self.recovering.store(false, Ordering::SeqCst);
    }

    /// Returns `Err(last_step_name)` when no step succeeded.
    async fn ladder(&self, lightweight_only: bool) -> Result<(), &'static str> {
        let adapter = &self.options.connect_adapter;

        info!(adapter, "recovery: lightweight adapter reset");
        match self.host.adapter_down_up(adapter).await {
            Ok(()) => {
                tokio::time::sleep(LIGHTWEIGHT_RESET_WAIT).await;
                // The failure counter resets on the next successful
                // connect, not here.
                return Ok(());
            }
            Err(e) => {
                error!(adapter, "lightweight reset unavailable, skipping: {e}");
                if lightweight_only {
                    return Err("lightweight reset");
                }
                tokio::time::sleep(self.options.cooldown).await;
            }
        }

        info!(adapter, "recovery: full adapter reset");
        match self.host.adapter_reset(adapter).await {
            Ok(()) => {
                tokio::time::sleep(FULL_RESET_WAIT).await;
                return Ok(());
            }
            Err(e) => {
                error!(adapter, "full reset unavailable, skipping: {e}");
                tokio::time::sleep(self.options.cooldown).await;
            }
        }

        info!("recovery: Bluetooth stack restart");
        match self.host.restart_stack().await {
            Ok(()) => {
                tokio::time::sleep(STACK_RESTART_WAIT).await;
                self.ledger.reset_after_recovery();
                Ok(())
            }
            Err(e) => {
                error!("stack restart unavailable: {e}");
                Err("stack restart")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::BleAdapter;
    use crate::cache::ScanCache;
    use crate::mock::{MockAdapter, MockHostControl};
    use crate::scanner::Scanner;

    struct Fixture {
        ledger: Arc<FailureLedger>,
        coordinator: Arc<Coordinator>,
        host: Arc<MockHostControl>,
        adapter: Arc<MockAdapter>,
        failure_tx: mpsc::UnboundedSender<FailureSignal>,
        cancel: CancellationToken,
    }

    fn start_watchdog(options: WatchdogOptions, privileged: bool) -> Fixture {
        let ledger = Arc::new(FailureLedger::new());
        let coordinator = Arc::new(Coordinator::new(true, Duration::from_secs(90)));
        let host = Arc::new(MockHostControl::new());
        host.set_privileged(privileged);
        let adapter = Arc::new(MockAdapter::new());
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));

        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let scanner = Scanner::new(
            adapter.clone() as Arc<dyn BleAdapter>,
            cache,
            Arc::clone(&coordinator),
            failure_tx.clone(),
        );
        let handle = scanner.handle();
        let cancel = CancellationToken::new();
        scanner.start(cancel.clone());

        let watchdog = Watchdog::new(
            options,
            Arc::clone(&ledger),
            Arc::clone(&coordinator),
            host.clone() as Arc<dyn HostControl>,
            handle,
            failure_rx,
        );
        watchdog.start(cancel.clone());

        Fixture {
            ledger,
            coordinator,
            host,
            adapter,
            failure_tx,
            cancel,
        }
    }

    async fn wait_until<F>(what: &str, mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn fast_options() -> WatchdogOptions {
        WatchdogOptions {
            check_interval: Duration::from_millis(50),
            cooldown: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_lightweight_reset() {
        let fx = start_watchdog(fast_options(), true);
        for _ in 0..3 {
            fx.ledger.record_connect_failure();
        }

        wait_until("lightweight reset", || {
            fx.host.actions().contains(&"down_up hci1".to_string())
        })
        .await;
        // First step succeeded, the ladder stops there.
        assert!(!fx.host.actions().contains(&"restart_stack".to_string()));
        // Scanner is rebuilt after recovery.
        wait_until("scanner rebuild", || fx.adapter.recreate_count() >= 1).await;
        // Counter is reset by the next successful connect, not here.
        assert_eq!(fx.ledger.consecutive_failures(), 3);
        fx.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprivileged_walks_whole_ladder() {
        let fx = start_watchdog(fast_options(), false);
        for _ in 0..3 {
            fx.ledger.record_connect_failure();
        }

        wait_until("full ladder", || {
            let actions = fx.host.actions();
            actions.contains(&"down_up hci1".to_string())
                && actions.contains(&"reset hci1".to_string())
                && actions.contains(&"restart_stack".to_string())
        })
        .await;
        fx.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stack_restart_keeps_counter() {
        let fx = start_watchdog(fast_options(), false);
        for _ in 0..3 {
            fx.ledger.record_connect_failure();
        }
        wait_until("stack restart attempt", || {
            fx.host.actions().contains(&"restart_stack".to_string())
        })
        .await;
        // No step succeeded, so nothing may claim the counters.
        assert_eq!(fx.ledger.consecutive_failures(), 3);
        fx.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_signal_wakes_immediately() {
        let options = WatchdogOptions {
            // Long period: only the event path can trigger in time.
            check_interval: Duration::from_secs(3600),
            cooldown: Duration::from_millis(50),
            ..Default::default()
        };
        let fx = start_watchdog(options, true);

        fx.failure_tx
            .send(FailureSignal::ConnectFailure { streak: 3 })
            .unwrap();
        wait_until("event-driven recovery", || {
            fx.host.actions().contains(&"down_up hci1".to_string())
        })
        .await;
        fx.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_probe_force_resets() {
        let fx = start_watchdog(fast_options(), true);

        // Open an epoch and let it go stale, as a hung handler would.
        fx.coordinator.request_pause();
        tokio::time::advance(Duration::from_secs(91)).await;

        wait_until("force reset", || fx.coordinator.epoch_age().is_none()).await;
        fx.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_is_noop() {
        let fx = start_watchdog(fast_options(), true);
        fx.ledger.record_connect_failure();
        fx.ledger.record_connect_failure();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            fx.host
                .actions()
                .iter()
                .all(|action| action.starts_with("status"))
        );
        fx.cancel.cancel();
    }
}
