//! Background scanner: continuous scanning, pause handoff, stall repair.
//!
//! The scanner drives the scan-side adapter and feeds the scan cache. On
//! every tick it checks three things:
//!
//! 1. Did the coordinator ask it to yield? Stop, acknowledge, wait for
//!    the client (bounded), restart, announce readiness.
//! 2. Has the stack gone quiet? No ingested records for a long stretch
//!    while the scanner itself is old means the stack silently stalled;
//!    tear the scanner down and rebuild it.
//! 3. Did the watchdog ask for a rebuild after a recovery action?
//!
//! Scan-start failures back off exponentially and, when they persist,
//! raise a signal to the watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use orchestrator_types::normalize_mac;

use crate::adapter::BleAdapter;
use crate::cache::ScanCache;
use crate::coordinator::{CLIENT_COMPLETED_WAIT, Coordinator};
use crate::retry::RetryConfig;
use crate::watchdog::FailureSignal;

/// Scanner housekeeping period.
const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// No ingested records for this long marks the stack as possibly stalled.
const STALL_QUIET_PERIOD: Duration = Duration::from_secs(90);
/// Minimum spacing between scanner rebuilds.
const RECREATE_MIN_INTERVAL: Duration = Duration::from_secs(180);
/// Consecutive scan-start failures before the watchdog is signalled.
const SCAN_START_FAILURE_SIGNAL_AFTER: u32 = 3;

struct Shared {
    recreate_requested: AtomicBool,
    last_ingest: std::sync::Mutex<Instant>,
    last_created: std::sync::Mutex<Instant>,
}

/// Cloneable handle other components use to poke the scanner.
#[derive(Clone)]
pub struct ScannerHandle {
    shared: Arc<Shared>,
}

impl ScannerHandle {
    /// Ask the scanner to tear down and rebuild its backend on the next
    /// tick. Used by the watchdog after a recovery action.
    pub fn request_recreate(&self) {
        self.shared.recreate_requested.store(true, Ordering::SeqCst);
    }

    /// How long ago the scanner last ingested a record.
    pub fn quiet_for(&self) -> Duration {
        self.shared
            .last_ingest
            .lock()
            .expect("scanner shared")
            .elapsed()
    }
}

/// The background scanning task.
pub struct Scanner {
    adapter: Arc<dyn BleAdapter>,
    cache: Arc<ScanCache>,
    coordinator: Arc<Coordinator>,
    failure_tx: mpsc::UnboundedSender<FailureSignal>,
    shared: Arc<Shared>,
}

impl Scanner {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        cache: Arc<ScanCache>,
        coordinator: Arc<Coordinator>,
        failure_tx: mpsc::UnboundedSender<FailureSignal>,
    ) -> Self {
        let now = Instant::now();
        Self {
            adapter,
            cache,
            coordinator,
            failure_tx,
            shared: Arc::new(Shared {
                recreate_requested: AtomicBool::new(false),
                last_ingest: std::sync::Mutex::new(now),
                last_created: std::sync::Mutex::new(now),
            }),
        }
    }

    pub fn handle(&self) -> ScannerHandle {
        ScannerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the scanner task. Runs until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        info!("scanner starting");
        if !self.start_scan_with_backoff(&cancel).await {
            return;
        }
        self.mark_created();
        self.mark_ingest();
        self.coordinator.signal_scan_ready();

        let mut adverts = self.adapter.advertisements();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                received = adverts.recv() => match received {
                    Ok(mut record) => {
                        if let Ok(canonical) = normalize_mac(&record.address) {
                            record.address = canonical;
                        }
                        self.cache.ingest(record).await;
                        self.mark_ingest();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "advertisement stream lagged, records dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        error!("advertisement stream closed");
                        break;
                    }
                },

                _ = tick.tick() => {
                    if self.coordinator.stop_requested() {
                        self.yield_to_client(&cancel).await;
                        continue;
                    }

                    self.cache.sweep().await;

                    if self.shared.recreate_requested.swap(false, Ordering::SeqCst) {
                        info!("scanner rebuild requested");
                        self.recreate(&cancel).await;
                        continue;
                    }

                    if self.quiet_elapsed() > STALL_QUIET_PERIOD
                        && self.created_elapsed() > RECREATE_MIN_INTERVAL
                    {
                        warn!(
                            quiet_sec = self.quiet_elapsed().as_secs(),
                            "no advertisements for too long, rebuilding scanner"
                        );
                        self.recreate(&cancel).await;
                    }
                }
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stop_scan during shutdown failed: {e}");
        }
        info!("scanner stopped");
    }

    /// Pause handoff: stop, acknowledge, wait for the client, resume.
    async fn yield_to_client(&self, cancel: &CancellationToken) {
        debug!("pausing scan for client access");
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stop_scan for client access failed: {e}");
        }
        self.coordinator.signal_scan_stopped();

        tokio::select! {
            _ = self.coordinator.wait_client_completed(CLIENT_COMPLETED_WAIT) => {}
            _ = cancel.cancelled() => return,
        }

        if self.start_scan_with_backoff(cancel).await {
            // A fresh start counts as activity; do not let the pause
            // itself look like a stall.
            self.mark_ingest();
            self.coordinator.signal_scan_ready();
            debug!("scan resumed after client access");
        }
    }

    /// Tear down and rebuild the scanner backend, then resume scanning.
    async fn recreate(&self, cancel: &CancellationToken) {
        if let Err(e) = self.adapter.recreate_scanner().await {
            error!("scanner rebuild failed: {e}");
            let _ = self.failure_tx.send(FailureSignal::ScanStalled);
            return;
        }
        if self.start_scan_with_backoff(cancel).await {
            self.mark_created();
            self.mark_ingest();
            self.coordinator.signal_scan_ready();
            info!("scanner rebuilt");
        }
    }

    /// Start scanning, retrying with exponential backoff on transient
    /// errors. Returns false only when cancelled.
    async fn start_scan_with_backoff(&self, cancel: &CancellationToken) -> bool {
        let backoff = RetryConfig::for_scan_start();
        let mut attempt: u32 = 0;
        loop {
            match self.adapter.start_scan().await {
                Ok(()) => return true,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, "scan start failed ({e}), retrying in {:?}", delay);
                    if attempt == SCAN_START_FAILURE_SIGNAL_AFTER {
                        let _ = self
                            .failure_tx
                            .send(FailureSignal::ScanStartFailed { attempts: attempt });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }

    fn mark_ingest(&self) {
        *self.shared.last_ingest.lock().expect("scanner shared") = Instant::now();
    }

    fn mark_created(&self) {
        *self.shared.last_created.lock().expect("scanner shared") = Instant::now();
    }

    fn quiet_elapsed(&self) -> Duration {
        self.shared
            .last_ingest
            .lock()
            .expect("scanner shared")
            .elapsed()
    }

    fn created_elapsed(&self) -> Duration {
        self.shared
            .last_created
            .lock()
            .expect("scanner shared")
            .elapsed()
    }
}
