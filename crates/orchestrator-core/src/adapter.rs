//! Adapter facade: the single point of mediation with the BLE stack.
//!
//! Every Bluetooth primitive the orchestrator uses goes through the
//! [`BleAdapter`] trait. Production wires in the btleplug-backed
//! implementation ([`crate::btle::BtleAdapter`]); tests wire in
//! [`crate::mock::MockAdapter`]. Nothing else in the engine is allowed to
//! touch the stack, which is what makes the arbitration guarantees
//! enforceable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use orchestrator_types::ScanRecord;

use crate::error::Result;

/// Capacity of the advertisement broadcast channel. A slow consumer
/// loses old records rather than stalling the scanner.
pub const ADVERTISEMENT_CHANNEL_CAPACITY: usize = 256;

/// Abstraction over the host BLE stack.
///
/// The scan side and the connect side may be different physical adapters;
/// the implementation hides which is which. Implementations must be safe
/// to share behind an `Arc` across tasks.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Start continuous scanning on the scan-side adapter.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning on the scan-side adapter.
    async fn stop_scan(&self) -> Result<()>;

    /// Tear down and rebuild the scanner backend.
    ///
    /// The stack is known to silently stall; a rebuild is the only
    /// reliable way out. Implementations must leave scanning stopped.
    async fn recreate_scanner(&self) -> Result<()>;

    /// Subscribe to the stream of advertisement observations.
    ///
    /// Records arrive only while scanning is active.
    fn advertisements(&self) -> broadcast::Receiver<ScanRecord>;

    /// Open a connection to `mac` on the connect-side adapter.
    ///
    /// `timeout` bounds this single attempt; retry policy lives with the
    /// caller.
    async fn connect(&self, mac: &str, timeout: Duration) -> Result<Arc<dyn BleConnection>>;
}

/// An open connection to one BLE peripheral.
#[async_trait]
pub trait BleConnection: Send + Sync + std::fmt::Debug {
    /// Canonical MAC of the connected peripheral.
    fn mac(&self) -> &str;

    /// Whether the link is still up.
    async fn is_connected(&self) -> bool;

    /// Read a GATT characteristic.
    async fn read(&self, service_uuid: &str, characteristic_uuid: &str) -> Result<Vec<u8>>;

    /// Write a GATT characteristic, with or without response.
    async fn write(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Install a stack-level notify handler on a characteristic.
    ///
    /// Notification values arrive on the returned channel until
    /// [`BleConnection::unsubscribe`] is called or the link drops.
    async fn subscribe(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>>;

    /// Remove the notify handler from a characteristic.
    async fn unsubscribe(&self, characteristic_uuid: &str) -> Result<()>;

    /// Close the link. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}
