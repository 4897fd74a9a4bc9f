//! btleplug-backed implementation of the adapter facade.
//!
//! Uses two host adapters when available: one dedicated to scanning, one
//! to client connections, selected by their `hciX` names. On hosts with a
//! single adapter both roles fall back to it; the exclusive-control
//! coordinator is what keeps that workable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use orchestrator_types::{ScanRecord, normalize_mac};

use crate::adapter::{ADVERTISEMENT_CHANNEL_CAPACITY, BleAdapter, BleConnection};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::handler::epoch_seconds;

/// How long the connect side scans when asked for a peripheral it has
/// never seen.
const CONNECT_DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// Production [`BleAdapter`] over btleplug.
pub struct BtleAdapter {
    scan_adapter_id: String,
    connect_adapter_id: String,
    scan_adapter: RwLock<Adapter>,
    connect_adapter: Adapter,
    adverts: broadcast::Sender<ScanRecord>,
    event_pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BtleAdapter {
    /// Resolve the scan- and connect-side adapters by host name.
    pub async fn new(scan_adapter_id: &str, connect_adapter_id: &str) -> Result<Self> {
        let manager = Manager::new().await?;
        let scan_adapter = Self::resolve_adapter(&manager, scan_adapter_id, 0).await?;
        let connect_adapter = Self::resolve_adapter(&manager, connect_adapter_id, 1).await?;
        let (adverts, _) = broadcast::channel(ADVERTISEMENT_CHANNEL_CAPACITY);

        Ok(Self {
            scan_adapter_id: scan_adapter_id.to_string(),
            connect_adapter_id: connect_adapter_id.to_string(),
            scan_adapter: RwLock::new(scan_adapter),
            connect_adapter,
            adverts,
            event_pump: Mutex::new(None),
        })
    }

    /// Pick the adapter whose info mentions `name`; fall back by index,
    /// then to the first adapter on single-adapter hosts.
    async fn resolve_adapter(manager: &Manager, name: &str, fallback_index: usize) -> Result<Adapter> {
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(Error::connection_failed(
                name,
                ConnectionFailureReason::AdapterUnavailable,
            ));
        }

        for adapter in &adapters {
            if let Ok(info) = adapter.adapter_info().await {
                if info.contains(name) {
                    info!(adapter = %info, "resolved adapter '{name}'");
                    return Ok(adapter.clone());
                }
            }
        }

        let index = fallback_index.min(adapters.len() - 1);
        warn!("adapter '{name}' not found, falling back to adapter #{index}");
        Ok(adapters[index].clone())
    }

    /// Pump central events into the advertisement channel.
    async fn spawn_event_pump(&self) -> Result<()> {
        let mut pump = self.event_pump.lock().await;
        if pump.is_some() {
            return Ok(());
        }

        let adapter = self.scan_adapter.read().await.clone();
        let tx = self.adverts.clone();
        let mut events = adapter.events().await?;

        *pump = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let record = ScanRecord {
                    address: props.address.to_string(),
                    name: props.local_name,
                    rssi: props.rssi,
                    manufacturer_data: props
                        .manufacturer_data
                        .iter()
                        .map(|(company, data)| (ScanRecord::company_key(*company), data.clone()))
                        .collect(),
                    service_uuids: props.services.iter().map(|u| u.to_string()).collect(),
                    // btleplug does not expose the raw advertisement
                    // payload; service data stands in for it.
                    payload: props
                        .service_data
                        .values()
                        .flat_map(|data| data.iter().copied())
                        .collect(),
                    timestamp: epoch_seconds(),
                };
                let _ = tx.send(record);
            }
            debug!("central event stream ended");
        }));
        Ok(())
    }

    /// Search the connect adapter's known peripherals for `mac`.
    async fn find_peripheral(&self, mac: &str) -> Result<Option<Peripheral>> {
        let wanted = normalize_mac(mac).unwrap_or_else(|_| mac.to_string());
        for peripheral in self.connect_adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                let address = normalize_mac(&props.address.to_string())
                    .unwrap_or_else(|_| props.address.to_string());
                if address == wanted {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BleAdapter for BtleAdapter {
    async fn start_scan(&self) -> Result<()> {
        self.spawn_event_pump().await?;
        let adapter = self.scan_adapter.read().await.clone();
        adapter.start_scan(ScanFilter::default()).await?;
        info!(adapter = %self.scan_adapter_id, "scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter = self.scan_adapter.read().await.clone();
        adapter.stop_scan().await?;
        Ok(())
    }

    async fn recreate_scanner(&self) -> Result<()> {
        info!(adapter = %self.scan_adapter_id, "rebuilding scanner backend");
        if let Some(pump) = self.event_pump.lock().await.take() {
            pump.abort();
        }
        let _ = self.stop_scan().await;

        // A fresh Manager re-enumerates the host adapters; the old handle
        // is the one wedged in the stalled state.
        let manager = Manager::new().await?;
        let fresh = Self::resolve_adapter(&manager, &self.scan_adapter_id, 0).await?;
        *self.scan_adapter.write().await = fresh;
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<ScanRecord> {
        self.adverts.subscribe()
    }

    async fn connect(&self, mac: &str, timeout: Duration) -> Result<Arc<dyn BleConnection>> {
        let peripheral = match self.find_peripheral(mac).await? {
            Some(peripheral) => peripheral,
            None => {
                // The connect side does not run the continuous scan, so a
                // first contact needs a short discovery window of its own.
                debug!(
                    mac,
                    adapter = %self.connect_adapter_id,
                    "peripheral unknown, running discovery window"
                );
                self.connect_adapter.start_scan(ScanFilter::default()).await?;
                tokio::time::sleep(CONNECT_DISCOVERY_WINDOW.min(timeout)).await;
                let _ = self.connect_adapter.stop_scan().await;
                self.find_peripheral(mac).await?.ok_or_else(|| {
                    Error::connection_failed(
                        mac,
                        ConnectionFailureReason::Other(
                            "peripheral not visible to connect adapter".to_string(),
                        ),
                    )
                })?
            }
        };

        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::connection_failed(
                    mac,
                    ConnectionFailureReason::BleError(e.to_string()),
                ));
            }
            Err(_) => {
                return Err(Error::connection_failed(
                    mac,
                    ConnectionFailureReason::Timeout,
                ));
            }
        }
        peripheral.discover_services().await?;
        debug!(mac, "connected");

        Ok(Arc::new(BtleConnection {
            mac: normalize_mac(mac).unwrap_or_else(|_| mac.to_string()),
            peripheral,
            notify_tasks: Mutex::new(HashMap::new()),
        }))
    }
}

/// An open btleplug connection.
#[derive(Debug)]
pub struct BtleConnection {
    mac: String,
    peripheral: Peripheral,
    notify_tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl BtleConnection {
    fn find_characteristic(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<Characteristic> {
        let char_uuid = parse_uuid(characteristic_uuid)?;
        let service = parse_uuid(service_uuid).ok();

        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == char_uuid
                    && service.map_or(true, |s| c.service_uuid == s)
            })
            .ok_or_else(|| {
                Error::OperationFailed(format!(
                    "characteristic {characteristic_uuid} not found on {}",
                    self.mac
                ))
            })
    }
}

#[async_trait]
impl BleConnection for BtleConnection {
    fn mac(&self) -> &str {
        &self.mac
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn read(&self, service_uuid: &str, characteristic_uuid: &str) -> Result<Vec<u8>> {
        let characteristic = self.find_characteristic(service_uuid, characteristic_uuid)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let characteristic = self.find_characteristic(service_uuid, characteristic_uuid)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, payload, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let characteristic = self.find_characteristic(service_uuid, characteristic_uuid)?;
        self.peripheral.subscribe(&characteristic).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = self.peripheral.notifications().await?;
        let wanted = characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == wanted && tx.send(notification.value).is_err() {
                    break;
                }
            }
        });
        self.notify_tasks
            .lock()
            .await
            .insert(characteristic_uuid.to_string(), task);
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic_uuid: &str) -> Result<()> {
        if let Some(task) = self.notify_tasks.lock().await.remove(characteristic_uuid) {
            task.abort();
        }
        // Unsubscribe needs the characteristic; tolerate it being gone.
        if let Ok(char_uuid) = parse_uuid(characteristic_uuid) {
            if let Some(characteristic) = self
                .peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == char_uuid)
            {
                self.peripheral.unsubscribe(&characteristic).await?;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for (_, task) in self.notify_tasks.lock().await.drain() {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Parse a UUID, expanding 16- and 32-bit shorthand onto the Bluetooth
/// base UUID.
fn parse_uuid(text: &str) -> Result<uuid::Uuid> {
    let trimmed = text.trim();
    let expanded = match trimmed.len() {
        4 => format!("0000{trimmed}-0000-1000-8000-00805f9b34fb"),
        8 => format!("{trimmed}-0000-1000-8000-00805f9b34fb"),
        _ => trimmed.to_string(),
    };
    uuid::Uuid::parse_str(&expanded)
        .map_err(|_| Error::InvalidRequest(format!("invalid UUID '{text}'")))
}
