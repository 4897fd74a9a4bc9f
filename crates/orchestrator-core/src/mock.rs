//! Mock adapter implementation for testing.
//!
//! Implements [`BleAdapter`]/[`BleConnection`] without hardware so the
//! whole engine can be driven in unit and integration tests.
//!
//! # Features
//!
//! - **Failure injection**: fail the next N connects, or every connect
//! - **Latency simulation**: configurable connect delay (also used to
//!   simulate a hung connect for deadlock tests)
//! - **Scripted GATT data**: per-device characteristic values
//! - **Notification injection**: push values into active subscriptions
//! - **Call counters**: asserts like "no connect happened" stay cheap

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc};

use orchestrator_types::ScanRecord;

use crate::adapter::{ADVERTISEMENT_CHANNEL_CAPACITY, BleAdapter, BleConnection};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::host::{AdapterState, HostControl};

/// One write observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub characteristic_uuid: String,
    pub payload: Vec<u8>,
    pub with_response: bool,
}

#[derive(Default, Debug)]
struct MockDevice {
    /// characteristic uuid -> value served on read.
    values: HashMap<String, Vec<u8>>,
    writes: Vec<RecordedWrite>,
}

type DeviceTable = Arc<Mutex<HashMap<String, MockDevice>>>;

/// A mock BLE adapter.
pub struct MockAdapter {
    adverts: broadcast::Sender<ScanRecord>,
    devices: DeviceTable,
    active: Mutex<HashMap<String, Arc<MockConnection>>>,
    scanning: AtomicBool,
    connect_count: AtomicU32,
    scan_start_count: AtomicU32,
    recreate_count: AtomicU32,
    /// Connects left to fail before succeeding again.
    remaining_connect_failures: AtomicU32,
    always_fail_connect: AtomicBool,
    fail_scan_start: AtomicBool,
    connect_delay_ms: AtomicU64,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("scanning", &self.scanning.load(Ordering::Relaxed))
            .field("connect_count", &self.connect_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        let (adverts, _) = broadcast::channel(ADVERTISEMENT_CHANNEL_CAPACITY);
        Self {
            adverts,
            devices: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            scan_start_count: AtomicU32::new(0),
            recreate_count: AtomicU32::new(0),
            remaining_connect_failures: AtomicU32::new(0),
            always_fail_connect: AtomicBool::new(false),
            fail_scan_start: AtomicBool::new(false),
            connect_delay_ms: AtomicU64::new(0),
        }
    }

    // ---- test hooks ----

    /// Register a device and a characteristic value served on read.
    pub async fn set_char_value(&self, mac: &str, characteristic_uuid: &str, value: Vec<u8>) {
        let mut devices = self.devices.lock().await;
        devices
            .entry(mac.to_string())
            .or_default()
            .values
            .insert(characteristic_uuid.to_string(), value);
    }

    /// Register a device with no characteristics.
    pub async fn add_device(&self, mac: &str) {
        self.devices.lock().await.entry(mac.to_string()).or_default();
    }

    /// Emit an advertisement as if the scanner observed it now.
    pub fn advertise(&self, record: ScanRecord) {
        let _ = self.adverts.send(record);
    }

    /// Convenience: emit a minimal advertisement for `mac` with an RSSI.
    pub fn advertise_simple(&self, mac: &str, rssi: i16) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.advertise(ScanRecord {
            address: mac.to_string(),
            name: None,
            rssi: Some(rssi),
            manufacturer_data: Default::default(),
            service_uuids: Vec::new(),
            payload: Vec::new(),
            timestamp,
        });
    }

    /// Fail the next `n` connect attempts with a transient error.
    pub fn fail_next_connects(&self, n: u32) {
        self.remaining_connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every connect attempt until turned off again.
    pub fn set_always_fail_connect(&self, fail: bool) {
        self.always_fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail scan starts (to exercise the scanner's backoff path).
    pub fn set_fail_scan_start(&self, fail: bool) {
        self.fail_scan_start.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect by `delay`. A value past the connect timeout
    /// simulates a hung connect.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Push a notification value into the active subscription for
    /// `(mac, characteristic)`, if one exists.
    pub async fn push_notification(&self, mac: &str, characteristic_uuid: &str, value: Vec<u8>) {
        if let Some(conn) = self.active.lock().await.get(mac).cloned() {
            conn.deliver(characteristic_uuid, value).await;
        }
    }

    /// Simulate a stack-reported disconnect of `mac`.
    pub async fn drop_connection(&self, mac: &str) {
        if let Some(conn) = self.active.lock().await.remove(mac) {
            conn.sever().await;
        }
    }

    // ---- counters ----

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn scan_start_count(&self) -> u32 {
        self.scan_start_count.load(Ordering::SeqCst)
    }

    pub fn recreate_count(&self) -> u32 {
        self.recreate_count.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Writes recorded for a device, in order.
    pub async fn writes(&self, mac: &str) -> Vec<RecordedWrite> {
        self.devices
            .lock()
            .await
            .get(mac)
            .map(|d| d.writes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn start_scan(&self) -> Result<()> {
        self.scan_start_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_scan_start.load(Ordering::SeqCst) {
            return Err(Error::OperationFailed("scan start refused".to_string()));
        }
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn recreate_scanner(&self) -> Result<()> {
        self.recreate_count.fetch_add(1, Ordering::SeqCst);
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<ScanRecord> {
        self.adverts.subscribe()
    }

    async fn connect(&self, mac: &str, timeout: Duration) -> Result<Arc<dyn BleConnection>> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);

        let delay = Duration::from_millis(self.connect_delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(Error::connection_failed(
                    mac,
                    ConnectionFailureReason::Timeout,
                ));
            }
            tokio::time::sleep(delay).await;
        }

        let remaining = self.remaining_connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Error::connection_failed(
                mac,
                ConnectionFailureReason::BleError("injected failure".to_string()),
            ));
        }
        if self.always_fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(
                mac,
                ConnectionFailureReason::BleError("injected failure".to_string()),
            ));
        }

        if !self.devices.lock().await.contains_key(mac) {
            return Err(Error::connection_failed(
                mac,
                ConnectionFailureReason::Timeout,
            ));
        }

        let conn = Arc::new(MockConnection {
            mac: mac.to_string(),
            connected: AtomicBool::new(true),
            subs: Mutex::new(HashMap::new()),
            devices: Arc::clone(&self.devices),
        });

        self.active
            .lock()
            .await
            .insert(mac.to_string(), Arc::clone(&conn));
        Ok(conn)
    }
}

/// An open mock connection.
#[derive(Debug)]
pub struct MockConnection {
    mac: String,
    connected: AtomicBool,
    subs: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    devices: DeviceTable,
}

impl MockConnection {
    async fn deliver(&self, characteristic_uuid: &str, value: Vec<u8>) {
        if let Some(tx) = self.subs.lock().await.get(characteristic_uuid) {
            let _ = tx.send(value);
        }
    }

    async fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders closes every notification stream.
        self.subs.lock().await.clear();
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::OperationFailed("not connected".to_string()))
        }
    }
}

#[async_trait]
impl BleConnection for MockConnection {
    fn mac(&self) -> &str {
        &self.mac
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, _service_uuid: &str, characteristic_uuid: &str) -> Result<Vec<u8>> {
        self.check_connected()?;
        let devices = self.devices.lock().await;
        devices
            .get(&self.mac)
            .and_then(|d| d.values.get(characteristic_uuid))
            .cloned()
            .ok_or_else(|| {
                Error::OperationFailed(format!(
                    "characteristic {characteristic_uuid} not found"
                ))
            })
    }

    async fn write(
        &self,
        _service_uuid: &str,
        characteristic_uuid: &str,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.check_connected()?;
        let mut devices = self.devices.lock().await;
        let device = devices
            .get_mut(&self.mac)
            .ok_or_else(|| Error::OperationFailed("device vanished".to_string()))?;
        device.writes.push(RecordedWrite {
            characteristic_uuid: characteristic_uuid.to_string(),
            payload: payload.to_vec(),
            with_response,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        _service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs
            .lock()
            .await
            .insert(characteristic_uuid.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic_uuid: &str) -> Result<()> {
        self.subs.lock().await.remove(characteristic_uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.sever().await;
        Ok(())
    }
}

/// A mock [`HostControl`] that records every action.
pub struct MockHostControl {
    actions: std::sync::Mutex<Vec<String>>,
    /// When false, every command fails as if the privilege were missing.
    privileged: AtomicBool,
    state: std::sync::Mutex<AdapterState>,
}

impl Default for MockHostControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHostControl {
    pub fn new() -> Self {
        Self {
            actions: std::sync::Mutex::new(Vec::new()),
            privileged: AtomicBool::new(true),
            state: std::sync::Mutex::new(AdapterState::UpRunning),
        }
    }

    /// Make every administrative command fail, as an unprivileged daemon
    /// would experience.
    pub fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, Ordering::SeqCst);
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Actions attempted so far, in order (e.g. `"down_up hci1"`).
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().expect("actions lock").clone()
    }

    fn record(&self, action: String) -> Result<()> {
        self.actions.lock().expect("actions lock").push(action);
        if self.privileged.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::OperationFailed(
                "hciconfig exited with 1: Operation not permitted".to_string(),
            ))
        }
    }
}

#[async_trait]
impl HostControl for MockHostControl {
    async fn adapter_down_up(&self, adapter: &str) -> Result<()> {
        self.record(format!("down_up {adapter}"))
    }

    async fn adapter_reset(&self, adapter: &str) -> Result<()> {
        self.record(format!("reset {adapter}"))
    }

    async fn restart_stack(&self) -> Result<()> {
        self.record("restart_stack".to_string())
    }

    async fn adapter_status(&self, adapter: &str) -> Result<AdapterState> {
        self.record(format!("status {adapter}"))?;
        Ok(*self.state.lock().expect("state lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_read_scripted_value() {
        let adapter = MockAdapter::new();
        adapter
            .set_char_value("AA:BB:CC:DD:EE:01", "2a19", vec![0x64])
            .await;

        let conn = adapter
            .connect("AA:BB:CC:DD:EE:01", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.read("180f", "2a19").await.unwrap(), vec![0x64]);
        assert_eq!(adapter.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_injection_is_transient() {
        let adapter = MockAdapter::new();
        adapter.add_device("AA:BB:CC:DD:EE:01").await;
        adapter.fail_next_connects(2);

        for _ in 0..2 {
            assert!(
                adapter
                    .connect("AA:BB:CC:DD:EE:01", Duration::from_secs(1))
                    .await
                    .is_err()
            );
        }
        assert!(
            adapter
                .connect("AA:BB:CC:DD:EE:01", Duration::from_secs(1))
                .await
                .is_ok()
        );
        assert_eq!(adapter.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_device_times_out() {
        let adapter = MockAdapter::new();
        let err = adapter
            .connect("00:00:00:00:00:00", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ConnectionFailed");
    }

    #[tokio::test]
    async fn test_notification_delivery_and_sever() {
        let adapter = MockAdapter::new();
        adapter.add_device("AA:BB:CC:DD:EE:01").await;
        let conn = adapter
            .connect("AA:BB:CC:DD:EE:01", Duration::from_secs(1))
            .await
            .unwrap();

        let mut rx = conn.subscribe("180f", "2a19").await.unwrap();
        adapter
            .push_notification("AA:BB:CC:DD:EE:01", "2a19", vec![1, 2])
            .await;
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);

        adapter.drop_connection("AA:BB:CC:DD:EE:01").await;
        assert!(rx.recv().await.is_none());
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_host_control_records_and_fails_unprivileged() {
        let host = MockHostControl::new();
        host.adapter_down_up("hci1").await.unwrap();
        host.set_privileged(false);
        assert!(host.restart_stack().await.is_err());
        assert_eq!(host.actions(), vec!["down_up hci1", "restart_stack"]);
    }
}
