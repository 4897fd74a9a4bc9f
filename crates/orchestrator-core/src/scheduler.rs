//! Priority scheduler: two execution lanes over one request stream.
//!
//! The **serial lane** is a single worker draining a priority queue of
//! connect-based requests (read, write, subscribe, unsubscribe). Ordering
//! is (priority ascending, created_at ascending, insertion order); the
//! lane provides no fairness between priorities beyond re-reading the
//! queue head on every dispatch.
//!
//! The **parallel lane** is a fixed pool draining cache lookups, which
//! never touch the adapter and must not queue behind slow connects.
//!
//! The scheduler owns the request lifecycle: the age-skip policy, the
//! per-request deadline watchdog, backpressure at the serial watermark,
//! and the guarantee that every admitted request produces exactly one
//! terminal response.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use orchestrator_types::{QueueStats, RequestStatus};

use crate::error::{Error, Result};
use crate::request::{Request, Response, StatusCell};

/// Executes one request against the BLE stack (or the cache).
///
/// The scheduler calls this from its workers; the production
/// implementation is [`crate::handler::RequestHandler`].
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &Request,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;
}

/// Scheduler configuration distilled from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub skip_old_requests: bool,
    pub request_max_age: Duration,
    pub serial_queue_watermark: usize,
    pub parallel_workers: usize,
    pub parallel_lane_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            skip_old_requests: true,
            request_max_age: Duration::from_secs(30),
            serial_queue_watermark: 100,
            parallel_workers: 3,
            parallel_lane_timeout: Duration::from_secs(5),
        }
    }
}

struct ScheduledRequest {
    request: Request,
    status: StatusCell,
    responder: oneshot::Sender<Response>,
    cancel: CancellationToken,
}

impl ScheduledRequest {
    /// Emit the terminal response. Consumes the request; a gone session
    /// just drops the value.
    fn respond(self, response: Response) {
        if self.responder.send(response).is_err() {
            debug!(
                request_id = %self.request.request_id,
                "response dropped, session already gone"
            );
        }
    }
}

/// Entry in the serial priority queue.
///
/// `BinaryHeap` is a max-heap; ordering is inverted so the head is the
/// lowest (priority, created_at, seq) key.
struct SerialEntry {
    seq: u64,
    scheduled: ScheduledRequest,
}

impl SerialEntry {
    fn key(&self) -> (u8, tokio::time::Instant, u64) {
        (
            self.scheduled.request.priority as u8,
            self.scheduled.request.created_at,
            self.seq,
        )
    }
}

impl PartialEq for SerialEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for SerialEntry {}

impl PartialOrd for SerialEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SerialEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
struct Stats {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeout: AtomicU64,
    skipped: AtomicU64,
    processing: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            total_requests: self.total.load(Ordering::Relaxed),
            completed_requests: self.completed.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            timeout_requests: self.timeout.load(Ordering::Relaxed),
            skipped_requests: self.skipped.load(Ordering::Relaxed),
            processing_requests: self.processing.load(Ordering::Relaxed),
        }
    }

    fn count_terminal(&self, status: RequestStatus) {
        match status {
            RequestStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            RequestStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            RequestStatus::Timeout => self.timeout.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }
}

/// The two-lane priority scheduler.
pub struct Scheduler {
    options: SchedulerOptions,
    serial_queue: Mutex<BinaryHeap<SerialEntry>>,
    serial_notify: Notify,
    seq: AtomicU64,
    parallel_tx: mpsc::UnboundedSender<ScheduledRequest>,
    parallel_rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduledRequest>>>,
    stats: Stats,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        let (parallel_tx, parallel_rx) = mpsc::unbounded_channel();
        Self {
            options,
            serial_queue: Mutex::new(BinaryHeap::new()),
            serial_notify: Notify::new(),
            seq: AtomicU64::new(0),
            parallel_tx,
            parallel_rx: Mutex::new(Some(parallel_rx)),
            stats: Stats::default(),
        }
    }

    /// Admit a request, returning the channel its terminal response will
    /// arrive on.
    ///
    /// Cache lookups go to the parallel lane; everything else to the
    /// serial lane, where the backpressure watermark applies: above it,
    /// LOW-priority enqueues are rejected with `QueueFull` while HIGH and
    /// NORMAL are still admitted.
    pub async fn enqueue(
        self: &Arc<Self>,
        request: Request,
    ) -> Result<oneshot::Receiver<Response>> {
        let (responder, receiver) = oneshot::channel();
        let scheduled = ScheduledRequest {
            status: StatusCell::new(),
            cancel: CancellationToken::new(),
            request,
            responder,
        };

        if scheduled.request.operation.is_cache_lookup() {
            self.stats.total.fetch_add(1, Ordering::Relaxed);
            self.parallel_tx
                .send(scheduled)
                .map_err(|_| Error::Unavailable)?;
            return Ok(receiver);
        }

        let mut queue = self.serial_queue.lock().await;
        if queue.len() >= self.options.serial_queue_watermark
            && scheduled.request.priority == orchestrator_types::RequestPriority::Low
        {
            return Err(Error::QueueFull { queued: queue.len() });
        }
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = %scheduled.request.request_id,
            priority = %scheduled.request.priority,
            "request enqueued"
        );
        queue.push(SerialEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            scheduled,
        });
        drop(queue);
        self.serial_notify.notify_one();
        Ok(receiver)
    }

    /// Spawn the serial worker and the parallel pool.
    ///
    /// Workers run until `shutdown` is cancelled.
    pub fn start(
        self: &Arc<Self>,
        executor: Arc<dyn RequestExecutor>,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let scheduler = Arc::clone(self);
            let executor = Arc::clone(&executor);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.serial_worker(executor, shutdown).await;
            }));
        }

        // The parallel receiver is shared by the pool behind a mutex;
        // whichever worker is idle picks up the next lookup.
        let shared_rx = Arc::new(Mutex::new(
            self.parallel_rx
                .try_lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .expect("scheduler started twice"),
        ));
        for worker_id in 0..self.options.parallel_workers {
            let scheduler = Arc::clone(self);
            let executor = Arc::clone(&executor);
            let shutdown = shutdown.clone();
            let shared_rx = Arc::clone(&shared_rx);
            handles.push(tokio::spawn(async move {
                scheduler
                    .parallel_worker(worker_id, executor, shared_rx, shutdown)
                    .await;
            }));
        }

        handles
    }

    /// Current serial queue depth.
    pub async fn queue_size(&self) -> usize {
        self.serial_queue.lock().await.len()
    }

    /// Counter snapshot for status reporting.
    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    async fn serial_worker(
        self: Arc<Self>,
        executor: Arc<dyn RequestExecutor>,
        shutdown: CancellationToken,
    ) {
        info!("serial lane worker started");
        loop {
            let entry = {
                let mut queue = self.serial_queue.lock().await;
                queue.pop()
            };
            let Some(entry) = entry else {
                tokio::select! {
                    _ = self.serial_notify.notified() => continue,
                    _ = shutdown.cancelled() => break,
                }
            };
            self.process(entry.scheduled, &executor, None).await;
        }
        info!("serial lane worker stopped");
    }

    async fn parallel_worker(
        self: Arc<Self>,
        worker_id: usize,
        executor: Arc<dyn RequestExecutor>,
        shared_rx: Arc<Mutex<mpsc::UnboundedReceiver<ScheduledRequest>>>,
        shutdown: CancellationToken,
    ) {
        debug!(worker_id, "parallel lane worker started");
        loop {
            let scheduled = {
                let mut rx = shared_rx.lock().await;
                tokio::select! {
                    next = rx.recv() => next,
                    _ = shutdown.cancelled() => None,
                }
            };
            let Some(scheduled) = scheduled else { break };
            self.process(
                scheduled,
                &executor,
                Some(self.options.parallel_lane_timeout),
            )
            .await;
        }
        debug!(worker_id, "parallel lane worker stopped");
    }

    /// Drive one request to its terminal state.
    async fn process(
        &self,
        scheduled: ScheduledRequest,
        executor: &Arc<dyn RequestExecutor>,
        lane_timeout: Option<Duration>,
    ) {
        let request_id = scheduled.request.request_id.clone();

        // Age skip fires before any BLE work.
        if self.options.skip_old_requests && !scheduled.request.operation.is_cache_lookup() {
            let age = scheduled.request.age();
            if age > self.options.request_max_age {
                warn!(
                    request_id = %request_id,
                    age_sec = age.as_secs_f64(),
                    "request skipped due to age"
                );
                let err = Error::SkippedDueToAge {
                    age_sec: age.as_secs_f64(),
                    max_age_sec: self.options.request_max_age.as_secs_f64(),
                };
                scheduled.status.advance(RequestStatus::Failed);
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                scheduled.respond(Response::failed(request_id.as_str(), &err));
                return;
            }
        }

        scheduled.status.advance(RequestStatus::Processing);
        self.stats.processing.fetch_add(1, Ordering::Relaxed);

        // The lane deadline tightens, never loosens, the request deadline.
        let deadline = match lane_timeout {
            Some(lane) => scheduled
                .request
                .deadline
                .min(scheduled.request.created_at + lane),
            None => scheduled.request.deadline,
        };

        let cancel = scheduled.cancel.clone();
        let result = {
            let exec = executor.execute(&scheduled.request, cancel.clone());
            tokio::pin!(exec);
            tokio::select! {
                result = &mut exec => result,
                _ = sleep_until(deadline) => {
                    // Best-effort cancellation: the token tells the
                    // handler, dropping the future unwinds it, and its
                    // guards release the coordinator.
                    cancel.cancel();
                    Err(Error::timeout(
                        "request",
                        deadline - scheduled.request.created_at,
                    ))
                }
            }
        };

        self.stats.processing.fetch_sub(1, Ordering::Relaxed);

        let response = match result {
            Ok(value) => {
                scheduled.status.advance(RequestStatus::Completed);
                info!(request_id = %request_id, "request completed");
                Response::completed(request_id.as_str(), value)
            }
            Err(err) => {
                let response = Response::failed(request_id.as_str(), &err);
                scheduled.status.advance(response.status);
                match response.status {
                    RequestStatus::Timeout => {
                        error!(request_id = %request_id, "request timed out")
                    }
                    _ => warn!(request_id = %request_id, error = %err, "request failed"),
                }
                response
            }
        };
        self.stats.count_terminal(response.status);
        scheduled.respond(response);
    }
}
