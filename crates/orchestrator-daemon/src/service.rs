//! Service wiring: owns every engine component and their lifecycles.
//!
//! Components start in dependency order (scanner, scheduler lanes,
//! watchdog, notification sweeper) and stop in reverse. Stopping is
//! bounded: tasks are cancelled through one token and connections are
//! closed with best effort; shutdown never hangs on a wedged stack.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestrator_core::{
    BleAdapter, Config, Coordinator, FailureLedger, HostControl, NotificationManager,
    RequestHandler, ScanCache, Scanner, ScannerHandle, Scheduler, SchedulerOptions, Watchdog,
    WatchdogOptions,
};
use orchestrator_core::request::{Request, Response};
use orchestrator_types::ServiceStatusReport;

/// The assembled orchestrator service.
pub struct Orchestrator {
    config: Config,
    cache: Arc<ScanCache>,
    coordinator: Arc<Coordinator>,
    ledger: Arc<FailureLedger>,
    scheduler: Arc<Scheduler>,
    notifications: Arc<NotificationManager>,
    handler: Arc<RequestHandler>,
    scanner_handle: ScannerHandle,
    recovering: Arc<AtomicBool>,
    started_at: Instant,
    shutdown: CancellationToken,
    /// Components that can only be started once, parked here until then.
    pending: Mutex<Option<(Scanner, Watchdog)>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Assemble the service from a configuration and the two host seams.
    ///
    /// Nothing is spawned until [`Orchestrator::start`].
    pub fn new(config: Config, adapter: Arc<dyn BleAdapter>, host: Arc<dyn HostControl>) -> Self {
        let cache = Arc::new(ScanCache::new(config.scan_cache_ttl));
        let coordinator = Arc::new(Coordinator::new(
            config.exclusive_control_enabled,
            config.exclusive_control_timeout,
        ));
        let ledger = Arc::new(FailureLedger::new());
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let notifications = Arc::new(NotificationManager::new(
            Arc::clone(&adapter),
            Arc::clone(&coordinator),
            config.connect_timeout,
        ));

        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&adapter),
            Arc::clone(&coordinator),
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&notifications),
            failure_tx.clone(),
            config.connect_timeout,
            config.retry_count,
            config.retry_interval,
        ));

        let scheduler = Arc::new(Scheduler::new(SchedulerOptions {
            skip_old_requests: config.skip_old_requests,
            request_max_age: config.request_max_age,
            serial_queue_watermark: config.serial_queue_watermark,
            parallel_workers: config.parallel_workers,
            parallel_lane_timeout: config.parallel_lane_timeout,
        }));

        let scanner = Scanner::new(
            Arc::clone(&adapter),
            Arc::clone(&cache),
            Arc::clone(&coordinator),
            failure_tx,
        );
        let scanner_handle = scanner.handle();

        let watchdog = Watchdog::new(
            WatchdogOptions {
                check_interval: config.watchdog_interval,
                failure_threshold: config.failure_threshold,
                cooldown: config.recovery_cooldown,
                connect_adapter: config.connect_adapter.clone(),
                scan_adapter: config.scan_adapter.clone(),
            },
            Arc::clone(&ledger),
            Arc::clone(&coordinator),
            host,
            scanner_handle.clone(),
            failure_rx,
        );
        let recovering = watchdog.recovering_flag();

        Self {
            config,
            cache,
            coordinator,
            ledger,
            scheduler,
            notifications,
            handler,
            scanner_handle,
            recovering,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            pending: Mutex::new(Some((scanner, watchdog))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start every component. Idempotent only in the sense that a second
    /// call is a no-op with a warning.
    pub async fn start(&self) {
        let Some((scanner, watchdog)) = self.pending.lock().await.take() else {
            warn!("orchestrator already started");
            return;
        };

        info!("starting BLE orchestrator service");
        let executor: Arc<dyn orchestrator_core::RequestExecutor> =
            Arc::clone(&self.handler) as Arc<dyn orchestrator_core::RequestExecutor>;
        let mut tasks = self.tasks.lock().await;
        tasks.push(scanner.start(self.shutdown.clone()));
        tasks.extend(self.scheduler.start(executor, self.shutdown.clone()));
        tasks.push(watchdog.start(self.shutdown.clone()));
        tasks.push(self.notifications.start());
        info!("all components started");
    }

    /// Stop every component in reverse order, bounded.
    pub async fn stop(&self) {
        info!("stopping BLE orchestrator service");
        self.notifications.shutdown().await;
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("component did not stop in time, detaching");
            }
        }
        info!("BLE orchestrator service stopped");
    }

    /// Admit a request into the scheduler.
    pub async fn submit(
        &self,
        request: Request,
    ) -> orchestrator_core::Result<oneshot::Receiver<Response>> {
        self.scheduler.enqueue(request).await
    }

    /// The notification manager, for session sink registration/sweeps.
    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    /// Per-request timeout to apply when the client names none.
    pub fn default_request_timeout(&self) -> Duration {
        self.config.default_request_timeout
    }

    /// Deadline of the cache-lookup lane.
    pub fn parallel_lane_timeout(&self) -> Duration {
        self.config.parallel_lane_timeout
    }

    /// Snapshot for `get_service_status`.
    pub async fn status(&self) -> ServiceStatusReport {
        let failures = self.ledger.consecutive_failures();
        let adapter_status = if self.recovering.load(Ordering::SeqCst) {
            "recovering"
        } else if failures > 0 {
            "warning"
        } else {
            "ok"
        };
        ServiceStatusReport {
            is_running: true,
            adapter_status: adapter_status.to_string(),
            queue_size: self.scheduler.queue_size().await,
            uptime_sec: self.started_at.elapsed().as_secs_f64(),
            active_devices: self.cache.active_count().await,
            active_subscriptions: self.notifications.subscription_count().await,
            exclusive_control_enabled: self.coordinator.is_enabled(),
            stats: self.scheduler.stats(),
        }
    }

    /// Scanner handle, exposed for tests and diagnostics.
    pub fn scanner_handle(&self) -> &ScannerHandle {
        &self.scanner_handle
    }
}
