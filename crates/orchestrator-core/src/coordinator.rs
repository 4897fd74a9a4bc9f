//! Exclusive-control coordinator for scanner/client adapter handoff.
//!
//! The scanner and client operations share one radio path; running a
//! connect while the scanner is active is what hangs the stack. The
//! coordinator is the owned state object both sides talk to:
//!
//! - A handler opens an *epoch* with [`Coordinator::request_pause`] and
//!   waits for the scanner to acknowledge with `scan_stopped`.
//! - The scanner polls [`Coordinator::stop_requested`] on its tick,
//!   stops, signals, and waits for `client_completed`.
//! - The handler closes the epoch with [`Coordinator::notify_done`] on
//!   every exit path.
//!
//! Exclusive control is an advisory optimization, not a correctness
//! gate: every wait is bounded, and a handler that never hears
//! `scan_stopped` proceeds anyway with a warning. The deadlock probe
//! ([`Coordinator::probe_deadlock`]) catches an epoch that was opened
//! and never closed; [`Coordinator::force_reset`] is the recovery
//! action.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// How long a handler waits for the scanner to acknowledge a pause.
pub const SCAN_STOP_WAIT: Duration = Duration::from_secs(10);
/// How long the scanner waits for the client to finish before resuming.
pub const CLIENT_COMPLETED_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct EpochState {
    scanner_stopping: bool,
    client_connecting: bool,
    epoch_start: Option<Instant>,
}

/// Shared coordination state between the scanner and client operations.
#[derive(Debug)]
pub struct Coordinator {
    enabled: bool,
    deadlock_after: Duration,
    state: Mutex<EpochState>,
    scan_ready: watch::Sender<bool>,
    scan_stopped: watch::Sender<bool>,
    client_completed: watch::Sender<bool>,
}

impl Coordinator {
    /// Create a coordinator. Initial state: idle, `scan_ready` set.
    pub fn new(enabled: bool, deadlock_after: Duration) -> Self {
        Self {
            enabled,
            deadlock_after,
            state: Mutex::new(EpochState::default()),
            scan_ready: watch::Sender::new(true),
            scan_stopped: watch::Sender::new(false),
            client_completed: watch::Sender::new(false),
        }
    }

    /// Whether exclusive control is active at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Ask the scanner to yield the adapter, opening an epoch.
    ///
    /// Idempotent within an epoch: concurrent callers funnel through the
    /// mutex and only the first opens it. Returns `true` when this call
    /// opened a new epoch.
    pub fn request_pause(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.state.lock().expect("coordinator state");
        if state.epoch_start.is_some() {
            debug!("request_pause: epoch already open");
            return false;
        }
        state.scanner_stopping = true;
        state.client_connecting = true;
        state.epoch_start = Some(Instant::now());
        self.scan_ready.send_replace(false);
        self.scan_stopped.send_replace(false);
        self.client_completed.send_replace(false);
        debug!("exclusive-control epoch opened");
        true
    }

    /// Whether a pause has been requested and not yet completed.
    /// Polled by the scanner on its tick.
    pub fn stop_requested(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.state.lock().expect("coordinator state").scanner_stopping
    }

    /// Scanner acknowledgement: scanning has stopped.
    pub fn signal_scan_stopped(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().expect("coordinator state");
        state.scanner_stopping = false;
        self.scan_stopped.send_replace(true);
    }

    /// Scanner announcement: scanning is running again.
    pub fn signal_scan_ready(&self) {
        if !self.enabled {
            return;
        }
        self.scan_ready.send_replace(true);
    }

    /// Close the epoch: the client operation is done, scanner may resume.
    ///
    /// Safe to call when no epoch is open.
    pub fn notify_done(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().expect("coordinator state");
        state.scanner_stopping = false;
        state.client_connecting = false;
        state.epoch_start = None;
        self.client_completed.send_replace(true);
        self.scan_ready.send_replace(true);
        debug!("exclusive-control epoch closed");
    }

    /// Wait up to `timeout` for the scanner to acknowledge the pause.
    ///
    /// Returns `false` on elapse; the caller proceeds anyway.
    pub async fn wait_scan_stopped(&self, timeout: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        if !wait_event(&self.scan_stopped, timeout).await {
            warn!(
                "scanner did not acknowledge pause within {:?}, proceeding anyway",
                timeout
            );
            return false;
        }
        true
    }

    /// Wait up to `timeout` for the client operation to complete.
    ///
    /// Returns `false` on elapse; the scanner resumes and the epoch stays
    /// open for the deadlock probe.
    pub async fn wait_client_completed(&self, timeout: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        if !wait_event(&self.client_completed, timeout).await {
            warn!(
                "client did not complete within {:?}, forcing scanner resume",
                timeout
            );
            return false;
        }
        true
    }

    /// Age of the open epoch, if any.
    pub fn epoch_age(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("coordinator state")
            .epoch_start
            .map(|start| start.elapsed())
    }

    /// Whether a client has held the adapter past the deadlock threshold.
    pub fn probe_deadlock(&self) -> bool {
        self.enabled
            && self
                .epoch_age()
                .is_some_and(|age| age > self.deadlock_after)
    }

    /// Recovery action: clear all flags and release both waiters.
    ///
    /// Only legitimate after [`Coordinator::probe_deadlock`] returned true.
    pub fn force_reset(&self) {
        if !self.enabled {
            return;
        }
        let age = self.epoch_age();
        error!(
            ?age,
            "force-resetting exclusive control; a client held the adapter past the deadlock threshold"
        );
        let mut state = self.state.lock().expect("coordinator state");
        state.scanner_stopping = false;
        state.client_connecting = false;
        state.epoch_start = None;
        self.scan_stopped.send_replace(true);
        self.client_completed.send_replace(true);
        self.scan_ready.send_replace(true);
    }

    /// Whether a client operation currently holds (or is acquiring) the
    /// adapter. Surfaced through service status.
    pub fn client_connecting(&self) -> bool {
        self.state.lock().expect("coordinator state").client_connecting
    }
}

/// Wait until a level-triggered event is set, bounded by `timeout`.
async fn wait_event(tx: &watch::Sender<bool>, timeout: Duration) -> bool {
    let mut rx = tx.subscribe();
    if *rx.borrow() {
        return true;
    }
    tokio::time::timeout(timeout, async {
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}
