//! Request handler: executes one BLE operation end to end.
//!
//! The handler is the serial lane's executor. For a connect-based
//! request it resolves the device, takes the single-operation mutex,
//! opens an exclusive-control epoch, connects with retry, performs the
//! operation, disconnects, and closes the epoch. Every exit path
//! (success, failure, deadline cancellation) releases the coordinator,
//! because the epoch is held by an RAII guard.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{BleAdapter, BleConnection};
use crate::cache::ScanCache;
use crate::coordinator::{Coordinator, SCAN_STOP_WAIT};
use crate::error::{Error, Result};
use crate::ledger::FailureLedger;
use crate::notifications::NotificationManager;
use crate::request::{Operation, Request};
use crate::retry::{RetryConfig, with_retry};
use crate::scheduler::RequestExecutor;
use crate::watchdog::FailureSignal;

/// Seconds since the Unix epoch, as the wire wants timestamps.
pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Holds an exclusive-control epoch open; closes it on drop.
///
/// Dropping is how cancellation unwinds the handler, so the release must
/// not depend on reaching any particular line of the operation body.
pub struct EpochGuard {
    coordinator: Arc<Coordinator>,
}

impl EpochGuard {
    /// Open an epoch and wait (bounded) for the scanner to yield.
    pub async fn acquire(coordinator: Arc<Coordinator>) -> Self {
        coordinator.request_pause();
        coordinator.wait_scan_stopped(SCAN_STOP_WAIT).await;
        Self { coordinator }
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.coordinator.notify_done();
    }
}

/// Disconnects the connection when dropped, unless released first.
///
/// The drop path spawns the async disconnect; a cancelled operation
/// cannot await it.
struct ConnectionGuard {
    conn: Option<Arc<dyn BleConnection>>,
}

impl ConnectionGuard {
    fn new(conn: Arc<dyn BleConnection>) -> Self {
        Self { conn: Some(conn) }
    }

    fn conn(&self) -> &Arc<dyn BleConnection> {
        self.conn.as_ref().expect("connection already released")
    }

    /// Disconnect in-line and disarm the drop path.
    async fn disconnect(mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = conn.disconnect().await {
                        warn!("disconnect in guard drop failed: {e}");
                    }
                });
            }
        }
    }
}

/// Executes requests against the adapter facade.
pub struct RequestHandler {
    adapter: Arc<dyn BleAdapter>,
    coordinator: Arc<Coordinator>,
    cache: Arc<ScanCache>,
    ledger: Arc<FailureLedger>,
    notifications: Arc<NotificationManager>,
    failure_tx: mpsc::UnboundedSender<FailureSignal>,
    connect_timeout: Duration,
    retry: RetryConfig,
    /// Prevents two concurrent connect attempts even if the lane rules
    /// were bypassed.
    op_lock: Mutex<()>,
}

impl RequestHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        coordinator: Arc<Coordinator>,
        cache: Arc<ScanCache>,
        ledger: Arc<FailureLedger>,
        notifications: Arc<NotificationManager>,
        failure_tx: mpsc::UnboundedSender<FailureSignal>,
        connect_timeout: Duration,
        retry_count: u32,
        retry_interval: Duration,
    ) -> Self {
        Self {
            adapter,
            coordinator,
            cache,
            ledger,
            notifications,
            failure_tx,
            connect_timeout,
            retry: RetryConfig::for_connect(retry_count, retry_interval),
            op_lock: Mutex::new(()),
        }
    }

    /// Resolve a device: present in the scan cache, or already held open
    /// by the notification manager as a known peer.
    async fn resolve_device(&self, mac: &str) -> Result<()> {
        if self.cache.lookup(mac).await.is_some() {
            return Ok(());
        }
        if self.notifications.has_connection(mac).await {
            return Ok(());
        }
        warn!(mac, "device not found in scan cache");
        Err(Error::device_not_found(mac))
    }

    /// Connect with the configured retry ladder, updating the failure
    /// ledger and signalling the watchdog when the ladder is exhausted.
    async fn connect_with_retry(
        &self,
        mac: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BleConnection>> {
        let attempt = || async {
            tokio::select! {
                conn = self.adapter.connect(mac, self.connect_timeout) => conn,
                _ = cancel.cancelled() => Err(Error::Cancelled),
            }
        };

        match with_retry(&self.retry, "connect", attempt).await {
            Ok(conn) => Ok(conn),
            // A cancelled attempt says nothing about adapter health.
            Err(e @ Error::Cancelled) => Err(e),
            Err(e) => {
                let streak = self.ledger.record_connect_failure();
                let _ = self
                    .failure_tx
                    .send(FailureSignal::ConnectFailure { streak });
                Err(e)
            }
        }
    }

    async fn handle_read(
        &self,
        request: &Request,
        mac: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        self.resolve_device(mac).await?;

        let _op = self.op_lock.lock().await;
        let epoch = EpochGuard::acquire(Arc::clone(&self.coordinator)).await;

        let conn = ConnectionGuard::new(self.connect_with_retry(mac, cancel).await?);
        debug!(mac, characteristic_uuid, "connected for read");

        let value = tokio::select! {
            value = conn.conn().read(service_uuid, characteristic_uuid) => value?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        conn.disconnect().await?;
        self.ledger.record_connect_success();
        drop(epoch);

        info!(
            request_id = %request.request_id,
            mac,
            characteristic_uuid,
            bytes = value.len(),
            "read completed"
        );
        Ok(serde_json::json!({ "value": value }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_write(
        &self,
        request: &Request,
        mac: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: &[u8],
        wants_response: bool,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        self.resolve_device(mac).await?;

        let _op = self.op_lock.lock().await;
        let epoch = EpochGuard::acquire(Arc::clone(&self.coordinator)).await;

        let conn = ConnectionGuard::new(self.connect_with_retry(mac, cancel).await?);
        debug!(mac, characteristic_uuid, "connected for write");

        // Any stack-reported error anywhere in the write sequence is an
        // operation failure; partial progress is not inferred.
        let response_data = tokio::select! {
            result = async {
                conn.conn()
                    .write(service_uuid, characteristic_uuid, payload, wants_response)
                    .await?;
                if wants_response {
                    Ok(Some(conn.conn().read(service_uuid, characteristic_uuid).await?))
                } else {
                    Ok::<_, Error>(None)
                }
            } => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        conn.disconnect().await?;
        self.ledger.record_connect_success();
        drop(epoch);

        info!(
            request_id = %request.request_id,
            mac,
            characteristic_uuid,
            bytes = payload.len(),
            "write completed"
        );
        Ok(match response_data {
            Some(value) => serde_json::json!({ "value": value }),
            None => serde_json::json!({}),
        })
    }

    async fn handle_cache_lookup(&self, mac: &str) -> Result<serde_json::Value> {
        match self.cache.lookup(mac).await {
            Some(record) => Ok(serde_json::to_value(record)
                .map_err(|e| Error::OperationFailed(e.to_string()))?),
            None => Err(Error::device_not_found(mac)),
        }
    }
}

#[async_trait]
impl RequestExecutor for RequestHandler {
    async fn execute(
        &self,
        request: &Request,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        match &request.operation {
            Operation::CacheLookup { mac } => self.handle_cache_lookup(mac).await,
            Operation::Read {
                mac,
                service_uuid,
                characteristic_uuid,
            } => {
                self.handle_read(request, mac, service_uuid, characteristic_uuid, &cancel)
                    .await
            }
            Operation::Write {
                mac,
                service_uuid,
                characteristic_uuid,
                payload,
                wants_response,
            } => {
                self.handle_write(
                    request,
                    mac,
                    service_uuid,
                    characteristic_uuid,
                    payload,
                    *wants_response,
                    &cancel,
                )
                .await
            }
            Operation::Subscribe {
                mac,
                service_uuid,
                characteristic_uuid,
                callback_id,
                timeout,
            } => {
                self.resolve_device(mac).await?;
                self.notifications
                    .subscribe(mac, service_uuid, characteristic_uuid, callback_id, *timeout)
                    .await?;
                Ok(serde_json::json!({ "callback_id": callback_id }))
            }
            Operation::Unsubscribe { callback_id } => {
                self.notifications.unsubscribe(callback_id).await?;
                Ok(serde_json::json!({}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;
    use orchestrator_types::RequestPriority;

    struct Fixture {
        adapter: Arc<MockAdapter>,
        coordinator: Arc<Coordinator>,
        cache: Arc<ScanCache>,
        ledger: Arc<FailureLedger>,
        handler: RequestHandler,
        failure_rx: mpsc::UnboundedReceiver<FailureSignal>,
    }

    /// Acknowledge pause requests the way the scanner task would, so
    /// epoch waits resolve promptly.
    fn spawn_pause_acker(coordinator: Arc<Coordinator>) {
        tokio::spawn(async move {
            loop {
                if coordinator.stop_requested() {
                    coordinator.signal_scan_stopped();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(MockAdapter::new());
        let coordinator = Arc::new(Coordinator::new(true, Duration::from_secs(90)));
        spawn_pause_acker(Arc::clone(&coordinator));
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        let ledger = Arc::new(FailureLedger::new());
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let notifications = Arc::new(NotificationManager::new(
            adapter.clone() as Arc<dyn BleAdapter>,
            Arc::clone(&coordinator),
            Duration::from_secs(10),
        ));
        let handler = RequestHandler::new(
            adapter.clone() as Arc<dyn BleAdapter>,
            Arc::clone(&coordinator),
            Arc::clone(&cache),
            Arc::clone(&ledger),
            notifications,
            failure_tx,
            Duration::from_secs(10),
            2,
            Duration::from_millis(1),
        );
        Fixture {
            adapter,
            coordinator,
            cache,
            ledger,
            handler,
            failure_rx,
        }
    }

    fn read_request(mac: &str) -> Request {
        Request::new(
            "r1",
            Operation::Read {
                mac: mac.into(),
                service_uuid: "180f".into(),
                characteristic_uuid: "2a19".into(),
            },
            RequestPriority::Normal,
            Duration::from_secs(10),
        )
    }

    async fn seed_cache(fx: &Fixture, mac: &str) {
        fx.cache
            .ingest(orchestrator_types::ScanRecord {
                address: mac.to_string(),
                name: None,
                rssi: Some(-55),
                manufacturer_data: Default::default(),
                service_uuids: Vec::new(),
                payload: Vec::new(),
                timestamp: 0.0,
            })
            .await;
    }

    #[tokio::test]
    async fn test_read_unknown_device_fails_without_connect() {
        let fx = fixture();
        let err = fx
            .handler
            .execute(&read_request("AA:BB:CC:DD:EE:01"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "DeviceNotFound");
        assert_eq!(fx.adapter.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_read_success_resets_failure_streak() {
        let fx = fixture();
        seed_cache(&fx, "AA:BB:CC:DD:EE:01").await;
        fx.adapter
            .set_char_value("AA:BB:CC:DD:EE:01", "2a19", vec![0x64])
            .await;
        fx.ledger.record_connect_failure();

        let value = fx
            .handler
            .execute(&read_request("AA:BB:CC:DD:EE:01"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["value"], serde_json::json!([0x64]));
        assert_eq!(fx.ledger.consecutive_failures(), 0);
        // Epoch closed on the way out.
        assert!(fx.coordinator.epoch_age().is_none());
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_retried() {
        let fx = fixture();
        seed_cache(&fx, "AA:BB:CC:DD:EE:01").await;
        fx.adapter
            .set_char_value("AA:BB:CC:DD:EE:01", "2a19", vec![1])
            .await;
        fx.adapter.fail_next_connects(2);

        let value = fx
            .handler
            .execute(&read_request("AA:BB:CC:DD:EE:01"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["value"], serde_json::json!([1]));
        assert_eq!(fx.adapter.connect_count(), 3);
        assert_eq!(fx.ledger.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_signal_watchdog() {
        let mut fx = fixture();
        seed_cache(&fx, "AA:BB:CC:DD:EE:01").await;
        fx.adapter.set_always_fail_connect(true);

        let err = fx
            .handler
            .execute(&read_request("AA:BB:CC:DD:EE:01"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ConnectionFailed");
        assert_eq!(fx.ledger.consecutive_failures(), 1);
        assert!(matches!(
            fx.failure_rx.try_recv(),
            Ok(FailureSignal::ConnectFailure { streak: 1 })
        ));
        // Coordinator released despite the failure.
        assert!(fx.coordinator.epoch_age().is_none());
    }

    #[tokio::test]
    async fn test_write_with_response_reads_back() {
        let fx = fixture();
        seed_cache(&fx, "AA:BB:CC:DD:EE:01").await;
        fx.adapter
            .set_char_value("AA:BB:CC:DD:EE:01", "cba2", vec![0xAB])
            .await;

        let request = Request::new(
            "w1",
            Operation::Write {
                mac: "AA:BB:CC:DD:EE:01".into(),
                service_uuid: "s".into(),
                characteristic_uuid: "cba2".into(),
                payload: vec![0x57, 0x01, 0x01],
                wants_response: true,
            },
            RequestPriority::Normal,
            Duration::from_secs(10),
        );

        let value = fx
            .handler
            .execute(&request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["value"], serde_json::json!([0xAB]));

        let writes = fx.adapter.writes("AA:BB:CC:DD:EE:01").await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].payload, vec![0x57, 0x01, 0x01]);
        assert!(writes[0].with_response);
    }

    #[tokio::test]
    async fn test_cache_lookup_hits_without_connect() {
        let fx = fixture();
        seed_cache(&fx, "AA:BB:CC:DD:EE:01").await;

        let request = Request::new(
            "l1",
            Operation::CacheLookup {
                mac: "AA:BB:CC:DD:EE:01".into(),
            },
            RequestPriority::Normal,
            Duration::from_secs(5),
        );
        let value = fx
            .handler
            .execute(&request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["rssi"], serde_json::json!(-55));
        assert_eq!(value["address"], serde_json::json!("AA:BB:CC:DD:EE:01"));
        assert_eq!(fx.adapter.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_epoch() {
        let fx = fixture();
        seed_cache(&fx, "AA:BB:CC:DD:EE:01").await;
        fx.adapter.add_device("AA:BB:CC:DD:EE:01").await;
        fx.adapter.set_connect_delay(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let result = fx
            .handler
            .execute(&read_request("AA:BB:CC:DD:EE:01"), cancel)
            .await;
        assert!(result.is_err());
        assert!(fx.coordinator.epoch_age().is_none());
    }
}
