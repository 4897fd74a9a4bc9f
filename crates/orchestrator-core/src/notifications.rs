//! Notification manager: long-lived connections and subscription fan-out.
//!
//! One BLE connection per device carries every subscription against that
//! device. A subscribe for a new device opens the connection under the
//! exclusive-control protocol; further subscribes reuse it. When the
//! stack reports a disconnect, the manager reconnects indefinitely with
//! exponential backoff for as long as any subscription remains.
//! Notifications may be lost across the gap; nothing is replayed.
//!
//! Client sessions register a sink per callback id before the subscribe
//! request runs; the fan-out pushes one frame per subscription of the
//! matching (device, characteristic).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use orchestrator_types::NotificationFrame;

use crate::adapter::{BleAdapter, BleConnection};
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::handler::{EpochGuard, epoch_seconds};
use crate::retry::RetryConfig;

/// How often a connection's liveness is polled.
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How often expired (inactive) subscriptions are swept.
const INACTIVITY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// One client subscription.
#[derive(Debug)]
struct Subscription {
    mac: String,
    service_uuid: String,
    characteristic_uuid: String,
    session_id: String,
    sink: mpsc::UnboundedSender<NotificationFrame>,
    /// Zero means no inactivity timeout.
    timeout: Duration,
    last_seen: Instant,
}

struct CharStream {
    forward_task: tokio::task::JoinHandle<()>,
}

struct DeviceLink {
    conn: Arc<dyn BleConnection>,
    chars: HashMap<String, CharStream>,
    monitor_task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    /// callback_id -> subscription.
    subs: HashMap<String, Subscription>,
    /// mac -> link.
    links: HashMap<String, DeviceLink>,
    /// Sinks registered by sessions ahead of the subscribe request.
    pending_sinks: HashMap<String, (String, mpsc::UnboundedSender<NotificationFrame>)>,
}

struct Inner {
    adapter: Arc<dyn BleAdapter>,
    coordinator: Arc<Coordinator>,
    connect_timeout: Duration,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

/// Manages notification subscriptions and their device connections.
pub struct NotificationManager {
    inner: Arc<Inner>,
}

impl NotificationManager {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        coordinator: Arc<Coordinator>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                coordinator,
                connect_timeout,
                state: Mutex::new(State::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the inactivity sweeper. Runs until [`NotificationManager::shutdown`].
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(INACTIVITY_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = inner.shutdown.cancelled() => break,
                }
                let expired = {
                    let state = inner.state.lock().await;
                    state
                        .subs
                        .iter()
                        .filter(|(_, sub)| {
                            !sub.timeout.is_zero() && sub.last_seen.elapsed() > sub.timeout
                        })
                        .map(|(cb, _)| cb.clone())
                        .collect::<Vec<_>>()
                };
                for callback_id in expired {
                    info!(callback_id, "subscription expired from inactivity");
                    let _ = inner.remove_subscription(&callback_id).await;
                }
            }
        })
    }

    /// Register the session sink a subscribe request will bind to.
    ///
    /// Must happen before the request is admitted so the fan-out has
    /// somewhere to deliver from the first notification on.
    pub async fn register_sink(
        &self,
        callback_id: &str,
        session_id: &str,
        sink: mpsc::UnboundedSender<NotificationFrame>,
    ) {
        let mut state = self.inner.state.lock().await;
        state
            .pending_sinks
            .insert(callback_id.to_string(), (session_id.to_string(), sink));
    }

    /// Create a subscription. Opens or reuses the device connection.
    pub async fn subscribe(
        &self,
        mac: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        callback_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let (session_id, sink) = {
            let mut state = self.inner.state.lock().await;
            if state.subs.contains_key(callback_id) {
                return Err(Error::InvalidRequest(format!(
                    "callback_id {callback_id} already subscribed"
                )));
            }
            state.pending_sinks.remove(callback_id).ok_or_else(|| {
                Error::InvalidRequest(format!("no session sink for callback_id {callback_id}"))
            })?
        };

        self.inner.ensure_link(mac).await?;
        self.inner
            .ensure_char_stream(mac, service_uuid, characteristic_uuid)
            .await?;

        let mut state = self.inner.state.lock().await;
        state.subs.insert(
            callback_id.to_string(),
            Subscription {
                mac: mac.to_string(),
                service_uuid: service_uuid.to_string(),
                characteristic_uuid: characteristic_uuid.to_string(),
                session_id,
                sink,
                timeout,
                last_seen: Instant::now(),
            },
        );
        info!(mac, characteristic_uuid, callback_id, "subscribed");
        Ok(())
    }

    /// Tear down a subscription.
    ///
    /// The first call succeeds; later calls for the same callback id are
    /// `InvalidRequest` (callback unknown).
    pub async fn unsubscribe(&self, callback_id: &str) -> Result<()> {
        self.inner.remove_subscription(callback_id).await
    }

    /// Sweep every subscription (and pending sink) owned by a session.
    pub async fn remove_session(&self, session_id: &str) {
        let owned = {
            let mut state = self.inner.state.lock().await;
            state.pending_sinks.retain(|_, entry| entry.0 != session_id);
            state
                .subs
                .iter()
                .filter(|(_, sub)| sub.session_id == session_id)
                .map(|(cb, _)| cb.clone())
                .collect::<Vec<_>>()
        };
        for callback_id in owned {
            debug!(callback_id, session_id, "sweeping subscription for closed session");
            let _ = self.inner.remove_subscription(&callback_id).await;
        }
    }

    /// Whether a long-lived connection to `mac` is currently held.
    pub async fn has_connection(&self, mac: &str) -> bool {
        self.inner.state.lock().await.links.contains_key(mac)
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.state.lock().await.subs.len()
    }

    /// Disconnect everything and stop background tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let links: Vec<DeviceLink> = {
            let mut state = self.inner.state.lock().await;
            state.subs.clear();
            state.pending_sinks.clear();
            state.links.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.cancel.cancel();
            link.monitor_task.abort();
            for (_, stream) in link.chars {
                stream.forward_task.abort();
            }
            if let Err(e) = link.conn.disconnect().await {
                warn!("disconnect during shutdown failed: {e}");
            }
        }
        info!("notification manager stopped");
    }
}

impl Inner {
    /// Connect under the exclusive-control protocol with the standard
    /// connect retry ladder.
    async fn connect_exclusive(self: &Arc<Self>, mac: &str) -> Result<Arc<dyn BleConnection>> {
        let epoch = EpochGuard::acquire(Arc::clone(&self.coordinator)).await;
        let retry = RetryConfig::for_connect(2, Duration::from_secs(1));
        let conn = crate::retry::with_retry(&retry, "notification connect", || async {
            self.adapter.connect(mac, self.connect_timeout).await
        })
        .await?;
        drop(epoch);
        Ok(conn)
    }

    /// Open the device link if it does not exist yet.
    async fn ensure_link(self: &Arc<Self>, mac: &str) -> Result<()> {
        if self.state.lock().await.links.contains_key(mac) {
            return Ok(());
        }

        info!(mac, "opening notification connection");
        let conn = self.connect_exclusive(mac).await?;
        let cancel = self.shutdown.child_token();
        let monitor_task = {
            let inner = Arc::clone(self);
            let mac = mac.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move { inner.monitor_link(mac, cancel).await })
        };

        let mut state = self.state.lock().await;
        // A concurrent reconnect cannot have raced us here: links are only
        // created on this path, which runs in the serial lane.
        state.links.insert(
            mac.to_string(),
            DeviceLink {
                conn,
                chars: HashMap::new(),
                monitor_task,
                cancel,
            },
        );
        Ok(())
    }

    /// Install the stack-level notify handler for a characteristic if not
    /// already installed, and spawn its forwarder.
    async fn ensure_char_stream(
        self: &Arc<Self>,
        mac: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<()> {
        let conn = {
            let state = self.state.lock().await;
            let link = state
                .links
                .get(mac)
                .ok_or_else(|| Error::device_not_found(mac))?;
            if link.chars.contains_key(characteristic_uuid) {
                return Ok(());
            }
            Arc::clone(&link.conn)
        };

        let rx = conn.subscribe(service_uuid, characteristic_uuid).await?;
        let forward_task = self.spawn_forwarder(mac, characteristic_uuid, rx);

        let mut state = self.state.lock().await;
        if let Some(link) = state.links.get_mut(mac) {
            link.chars
                .insert(characteristic_uuid.to_string(), CharStream { forward_task });
        }
        Ok(())
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        mac: &str,
        characteristic_uuid: &str,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(self);
        let mac = mac.to_string();
        let characteristic_uuid = characteristic_uuid.to_string();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                inner.fanout(&mac, &characteristic_uuid, value).await;
            }
            debug!(mac, characteristic_uuid, "notification stream ended");
        })
    }

    /// Deliver one value to every subscription of (mac, characteristic).
    async fn fanout(self: &Arc<Self>, mac: &str, characteristic_uuid: &str, value: Vec<u8>) {
        let timestamp = epoch_seconds();
        let mut dead = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (callback_id, sub) in state.subs.iter_mut() {
                if sub.mac != mac || sub.characteristic_uuid != characteristic_uuid {
                    continue;
                }
                sub.last_seen = Instant::now();
                let frame = NotificationFrame::new(
                    callback_id.clone(),
                    mac,
                    characteristic_uuid,
                    value.clone(),
                    timestamp,
                );
                if sub.sink.send(frame).is_err() {
                    dead.push(callback_id.clone());
                }
            }
        }
        // A closed sink means the session is gone; sweep out of band so
        // the forwarder is not tearing down the task it runs in.
        for callback_id in dead {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let _ = inner.remove_subscription(&callback_id).await;
            });
        }
    }

    /// Remove one subscription; tear down its characteristic stream and
    /// connection when it was the last user.
    async fn remove_subscription(self: &Arc<Self>, callback_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let sub = state.subs.remove(callback_id).ok_or_else(|| {
            Error::InvalidRequest(format!("unknown callback_id {callback_id}"))
        })?;

        let char_still_used = state.subs.values().any(|s| {
            s.mac == sub.mac && s.characteristic_uuid == sub.characteristic_uuid
        });
        let mac_still_used = state.subs.values().any(|s| s.mac == sub.mac);

        if !char_still_used {
            if let Some(link) = state.links.get_mut(&sub.mac) {
                if let Some(stream) = link.chars.remove(&sub.characteristic_uuid) {
                    stream.forward_task.abort();
                    let conn = Arc::clone(&link.conn);
                    let characteristic_uuid = sub.characteristic_uuid.clone();
                    tokio::spawn(async move {
                        if let Err(e) = conn.unsubscribe(&characteristic_uuid).await {
                            warn!(characteristic_uuid, "unsubscribe failed: {e}");
                        }
                    });
                }
            }
        }

        if !mac_still_used {
            if let Some(link) = state.links.remove(&sub.mac) {
                info!(mac = %sub.mac, "closing notification connection, last subscriber gone");
                link.cancel.cancel();
                link.monitor_task.abort();
                for (_, stream) in link.chars {
                    stream.forward_task.abort();
                }
                let conn = link.conn;
                tokio::spawn(async move {
                    if let Err(e) = conn.disconnect().await {
                        warn!("disconnect after last unsubscribe failed: {e}");
                    }
                });
            }
        }

        info!(callback_id, "unsubscribed");
        Ok(())
    }

    /// Watch a device link; on stack-reported disconnect, reconnect with
    /// exponential backoff for as long as subscriptions remain.
    async fn monitor_link(self: Arc<Self>, mac: String, cancel: CancellationToken) {
        let backoff = RetryConfig::for_reconnect();
        loop {
            // Wait for the link to drop.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(LINK_POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
                let connected = {
                    let state = self.state.lock().await;
                    match state.links.get(&mac) {
                        Some(link) => link.conn.is_connected().await,
                        None => return,
                    }
                };
                if !connected {
                    break;
                }
            }
            warn!(mac, "notification connection dropped, reconnecting");

            // Reconnect indefinitely while any subscription remains.
            let mut attempt: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let still_wanted = {
                    let state = self.state.lock().await;
                    state.subs.values().any(|s| s.mac == mac)
                };
                if !still_wanted {
                    let mut state = self.state.lock().await;
                    state.links.remove(&mac);
                    return;
                }

                match self.connect_exclusive(&mac).await {
                    Ok(conn) => {
                        if let Err(e) = self.rebind_link(&mac, conn).await {
                            error!(mac, "failed to re-establish subscriptions: {e}");
                        } else {
                            info!(mac, "notification connection re-established");
                        }
                        break;
                    }
                    Err(e) => {
                        let delay = backoff.delay_for_attempt(attempt);
                        attempt = attempt.saturating_add(1);
                        warn!(mac, "reconnect failed ({e}), retrying in {:?}", delay);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
            }
        }
    }

    /// Swap in a fresh connection and re-install every characteristic
    /// stream the link's subscriptions need.
    async fn rebind_link(self: &Arc<Self>, mac: &str, conn: Arc<dyn BleConnection>) -> Result<()> {
        let wanted: Vec<(String, String)> = {
            let state = self.state.lock().await;
            let mut seen = std::collections::HashSet::new();
            state
                .subs
                .values()
                .filter(|s| s.mac == mac)
                .filter(|s| seen.insert(s.characteristic_uuid.clone()))
                .map(|s| (s.service_uuid.clone(), s.characteristic_uuid.clone()))
                .collect()
        };

        let mut streams = HashMap::new();
        for (service_uuid, characteristic_uuid) in wanted {
            let rx = conn.subscribe(&service_uuid, &characteristic_uuid).await?;
            let forward_task = self.spawn_forwarder(mac, &characteristic_uuid, rx);
            streams.insert(characteristic_uuid, CharStream { forward_task });
        }

        let mut state = self.state.lock().await;
        if let Some(link) = state.links.get_mut(mac) {
            for (_, stream) in link.chars.drain() {
                stream.forward_task.abort();
            }
            link.conn = conn;
            link.chars = streams;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    const MAC: &str = "AA:BB:CC:DD:EE:01";
    const CHAR: &str = "2a19";

    struct Fixture {
        adapter: Arc<MockAdapter>,
        manager: NotificationManager,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(MockAdapter::new());
        let coordinator = Arc::new(Coordinator::new(true, Duration::from_secs(90)));
        // Acknowledge pause requests the way the scanner task would.
        {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                loop {
                    if coordinator.stop_requested() {
                        coordinator.signal_scan_stopped();
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
        }
        let manager = NotificationManager::new(
            adapter.clone() as Arc<dyn BleAdapter>,
            coordinator,
            Duration::from_secs(10),
        );
        Fixture { adapter, manager }
    }

    async fn subscribe(
        fx: &Fixture,
        callback_id: &str,
    ) -> mpsc::UnboundedReceiver<NotificationFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        fx.manager.register_sink(callback_id, "session-1", tx).await;
        fx.manager
            .subscribe(MAC, "180f", CHAR, callback_id, Duration::ZERO)
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_subscribe_delivers_notifications() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let mut rx = subscribe(&fx, "cb1").await;
        fx.adapter.push_notification(MAC, CHAR, vec![1, 2, 3]).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, "notification");
        assert_eq!(frame.callback_id, "cb1");
        assert_eq!(frame.mac_address, MAC);
        assert_eq!(frame.value, vec![1, 2, 3]);
        assert!(frame.timestamp > 0.0);
    }

    #[tokio::test]
    async fn test_second_subscription_reuses_connection() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let _rx1 = subscribe(&fx, "cb1").await;
        let _rx2 = subscribe(&fx, "cb2").await;

        assert_eq!(fx.adapter.connect_count(), 1);
        assert_eq!(fx.manager.subscription_count().await, 2);

        // Both subscribers see the same value.
        fx.adapter.push_notification(MAC, CHAR, vec![7]).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_last_closes_connection() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let _rx1 = subscribe(&fx, "cb1").await;
        let _rx2 = subscribe(&fx, "cb2").await;

        fx.manager.unsubscribe("cb1").await.unwrap();
        assert!(fx.manager.has_connection(MAC).await);

        fx.manager.unsubscribe("cb2").await.unwrap();
        assert!(!fx.manager.has_connection(MAC).await);
        assert_eq!(fx.manager.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_double_unsubscribe_is_invalid() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let _rx = subscribe(&fx, "cb1").await;
        fx.manager.unsubscribe("cb1").await.unwrap();

        let err = fx.manager.unsubscribe("cb1").await.unwrap_err();
        assert_eq!(err.reason(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_duplicate_callback_id_rejected() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let _rx = subscribe(&fx, "cb1").await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        fx.manager.register_sink("cb1", "session-2", tx).await;
        let err = fx
            .manager
            .subscribe(MAC, "180f", CHAR, "cb1", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_session_sweep_removes_all_subscriptions() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let _rx1 = subscribe(&fx, "cb1").await;
        let _rx2 = subscribe(&fx, "cb2").await;

        fx.manager.remove_session("session-1").await;
        assert_eq!(fx.manager.subscription_count().await, 0);
        assert!(!fx.manager.has_connection(MAC).await);
    }

    #[tokio::test]
    async fn test_subscribe_without_registered_sink_fails() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let err = fx
            .manager
            .subscribe(MAC, "180f", CHAR, "ghost", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_reconnect_after_stack_disconnect() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;

        let mut rx = subscribe(&fx, "cb1").await;
        assert_eq!(fx.adapter.connect_count(), 1);

        fx.adapter.drop_connection(MAC).await;

        // The monitor polls every second and reconnects.
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.adapter.connect_count() < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("reconnect did not happen");

        // Give the rebind a moment to re-install the notify handler,
        // then values flow again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.adapter.push_notification(MAC, CHAR, vec![9]).await;
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame after reconnect")
            .unwrap();
        assert_eq!(frame.value, vec![9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_tears_down() {
        let fx = fixture();
        fx.adapter.add_device(MAC).await;
        let sweeper = fx.manager.start();

        let (tx, _rx) = mpsc::unbounded_channel();
        fx.manager.register_sink("cb1", "session-1", tx).await;
        fx.manager
            .subscribe(MAC, "180f", CHAR, "cb1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(fx.manager.subscription_count().await, 1);

        tokio::time::advance(Duration::from_secs(40)).await;
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while fx.manager.subscription_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("inactive subscription was not swept");
        sweeper.abort();
    }
}
