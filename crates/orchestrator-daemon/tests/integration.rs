//! End-to-end tests: full service over a Unix socket with the mock
//! adapter.
//!
//! Each test assembles the real component graph (scanner, scheduler,
//! handler, watchdog, notification manager, IPC server), binds a socket
//! in a temp directory, and drives it through the client library or raw
//! line frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use orchestrator_core::{Config, MockAdapter, MockHostControl};
use orchestrator_daemon::{IpcServer, Orchestrator, OrchestratorClient};

const MAC: &str = "AA:BB:CC:DD:EE:01";
const SERVICE: &str = "180f";
const CHAR: &str = "2a19";

struct TestDaemon {
    adapter: Arc<MockAdapter>,
    host: Arc<MockHostControl>,
    orchestrator: Arc<Orchestrator>,
    socket_path: String,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    async fn spawn(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir
            .path()
            .join("orchestrator.sock")
            .to_string_lossy()
            .into_owned();

        let mut config = Config::default();
        config.socket_path = socket_path.clone();
        tweak(&mut config);

        let adapter = Arc::new(MockAdapter::new());
        let host = Arc::new(MockHostControl::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            adapter.clone(),
            host.clone(),
        ));
        orchestrator.start().await;

        let server = IpcServer::bind(&config, Arc::clone(&orchestrator))
            .await
            .expect("bind");
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        let daemon = Self {
            adapter,
            host,
            orchestrator,
            socket_path,
            cancel,
            _dir: dir,
        };
        daemon.wait_until("scanner running", || daemon.adapter.is_scanning()).await;
        daemon
    }

    async fn client(&self) -> OrchestratorClient {
        OrchestratorClient::connect_unix(&self.socket_path)
            .await
            .expect("client connect")
    }

    async fn wait_until<F>(&self, what: &str, mut predicate: F)
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

    /// Advertise and wait until the record is in the cache.
    async fn seed_device(&self, mac: &str, rssi: i16) {
        self.adapter.advertise_simple(mac, rssi);
        let client = self.client().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if client.scan(mac).await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("device never appeared in the cache");
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------
// S1: cache hit answers without any connect
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_scan_command_cache_hit_no_connect() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    daemon.seed_device(MAC, -55).await;

    let client = daemon.client().await;
    let result = client.scan(MAC).await.expect("scan result");
    assert_eq!(result["rssi"], serde_json::json!(-55));
    assert_eq!(result["address"], serde_json::json!(MAC));
    assert_eq!(daemon.adapter.connect_count(), 0);

    daemon.stop();
}

#[tokio::test]
async fn test_scan_command_unknown_device() {
    let daemon = TestDaemon::spawn(|_| {}).await;

    let client = daemon.client().await;
    let err = client.scan("00:11:22:33:44:55").await.unwrap_err();
    assert!(err.to_string().contains("DeviceNotFound"));

    daemon.stop();
}

// ---------------------------------------------------------------------
// S2: priority reorder observed in the response stream
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_priority_reorder_over_socket() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_char_value(MAC, CHAR, vec![1]).await;
    // Hold the serial worker busy long enough for the queue to fill.
    daemon.adapter.set_connect_delay(Duration::from_millis(400));

    let stream = UnixStream::connect(&daemon.socket_path).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let frame = |rid: &str, priority: &str| {
        format!(
            "{{\"command\":\"read_command\",\"mac_address\":\"{MAC}\",\"service_uuid\":\"{SERVICE}\",\"characteristic_uuid\":\"{CHAR}\",\"request_id\":\"{rid}\",\"priority\":\"{priority}\"}}\n"
        )
    };

    // The blocker occupies the worker; R1..R3 queue up behind it.
    write.write_all(frame("BLOCKER", "HIGH").as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    write.write_all(frame("R1", "NORMAL").as_bytes()).await.unwrap();
    write.write_all(frame("R2", "HIGH").as_bytes()).await.unwrap();
    write.write_all(frame("R3", "NORMAL").as_bytes()).await.unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("response timed out")
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        order.push(value["request_id"].as_str().unwrap().to_string());
        assert_eq!(value["status"], serde_json::json!("success"));
    }
    assert_eq!(order, vec!["BLOCKER", "R2", "R1", "R3"]);

    daemon.stop();
}

// ---------------------------------------------------------------------
// S3: age skip fires before any adapter interaction
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_age_skip_while_queue_blocked() {
    let daemon = TestDaemon::spawn(|config| {
        config.request_max_age = Duration::from_millis(300);
    })
    .await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_char_value(MAC, CHAR, vec![1]).await;
    daemon.adapter.set_connect_delay(Duration::from_millis(800));

    let client = daemon.client().await;

    // Blocker holds the lane past the max age of the request behind it.
    let blocker = {
        let client = daemon.client().await;
        tokio::spawn(async move {
            client
                .read_characteristic(MAC, SERVICE, CHAR, None, None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connects_before = daemon.adapter.connect_count();
    let err = client
        .read_characteristic(MAC, SERVICE, CHAR, None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("SkippedDueToAge"));
    // The skipped request never touched the adapter.
    assert_eq!(daemon.adapter.connect_count(), connects_before);

    blocker.await.unwrap().expect("blocker should complete");
    daemon.stop();
}

// ---------------------------------------------------------------------
// S4: exclusive-control happy path
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_exclusive_control_pauses_and_resumes_scanner() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_char_value(MAC, CHAR, vec![0x42]).await;
    daemon.adapter.set_connect_delay(Duration::from_millis(300));

    let client = daemon.client().await;
    let read_task = {
        let client = daemon.client().await;
        tokio::spawn(async move {
            client
                .read_characteristic(MAC, SERVICE, CHAR, Some("HIGH"), None)
                .await
        })
    };

    // While the operation runs, the scanner yields the adapter.
    daemon
        .wait_until("scanner paused", || !daemon.adapter.is_scanning())
        .await;

    let result = read_task.await.unwrap().expect("read result");
    assert_eq!(result["value"], serde_json::json!([0x42]));

    // And resumes promptly after completion.
    daemon
        .wait_until("scanner resumed", || daemon.adapter.is_scanning())
        .await;

    // The happy path leaves no residue the status report can see.
    let status = client.status().await.unwrap();
    assert_eq!(status["adapter_status"], serde_json::json!("ok"));
    daemon.stop();
}

// ---------------------------------------------------------------------
// S5: deadlock recovery releases the scanner, request times out
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_deadlock_recovery() {
    let daemon = TestDaemon::spawn(|config| {
        // A hung connect: longer than the probe, shorter than forever.
        config.connect_timeout = Duration::from_secs(20);
        config.retry_count = 0;
        config.exclusive_control_timeout = Duration::from_millis(500);
        config.watchdog_interval = Duration::from_millis(100);
    })
    .await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_connect_delay(Duration::from_secs(10));

    let read_task = {
        let client = daemon.client().await;
        tokio::spawn(async move {
            client
                .read_characteristic(MAC, SERVICE, CHAR, None, Some(3.0))
                .await
        })
    };

    // The handler hangs in connect with the epoch open; the scanner
    // stops, the deadlock probe fires, and the scanner is released long
    // before the request's own deadline.
    daemon
        .wait_until("scanner paused", || !daemon.adapter.is_scanning())
        .await;
    daemon
        .wait_until("scanner force-resumed", || daemon.adapter.is_scanning())
        .await;
    // The release came from the deadlock probe, not from the request
    // finishing.
    assert!(!read_task.is_finished());

    // The stuck request still terminates, as a timeout.
    let err = read_task.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("Timeout"));

    daemon.stop();
}

// ---------------------------------------------------------------------
// S6: retry ladder and watchdog reset
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_transient_failures_recover_in_one_request() {
    let daemon = TestDaemon::spawn(|config| {
        config.retry_interval = Duration::from_millis(10);
    })
    .await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_char_value(MAC, CHAR, vec![7]).await;
    daemon.adapter.fail_next_connects(2);

    let client = daemon.client().await;
    let result = client
        .read_characteristic(MAC, SERVICE, CHAR, None, None)
        .await
        .expect("third attempt succeeds");
    assert_eq!(result["value"], serde_json::json!([7]));
    assert_eq!(daemon.adapter.connect_count(), 3);

    let status = client.status().await.unwrap();
    assert_eq!(status["adapter_status"], serde_json::json!("ok"));
    daemon.stop();
}

#[tokio::test]
async fn test_persistent_failures_trigger_lightweight_reset() {
    let daemon = TestDaemon::spawn(|config| {
        config.retry_interval = Duration::from_millis(10);
        config.watchdog_interval = Duration::from_millis(100);
    })
    .await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_always_fail_connect(true);

    let client = daemon.client().await;
    for _ in 0..3 {
        let err = client
            .read_characteristic(MAC, SERVICE, CHAR, None, Some(5.0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ConnectionFailed"));
    }

    // Threshold reached: the watchdog bounces the connect adapter and
    // rebuilds the scanner.
    daemon
        .wait_until("lightweight reset", || {
            daemon.host.actions().contains(&"down_up hci1".to_string())
        })
        .await;
    daemon
        .wait_until("scanner rebuilt", || daemon.adapter.recreate_count() >= 1)
        .await;

    daemon.stop();
}

// ---------------------------------------------------------------------
// Notifications: subscribe, fan-out, unsubscribe round trip
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_notification_round_trip() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.add_device(MAC).await;

    let client = daemon.client().await;
    let callback_id = client
        .subscribe_notifications(MAC, SERVICE, CHAR, None)
        .await
        .expect("subscribe");

    daemon.adapter.push_notification(MAC, CHAR, vec![1, 2, 3]).await;

    let frame = tokio::time::timeout(Duration::from_secs(5), client.next_notification())
        .await
        .expect("no notification")
        .expect("stream closed");
    assert_eq!(frame.callback_id, callback_id);
    assert_eq!(frame.mac_address, MAC);
    assert_eq!(frame.characteristic_uuid, CHAR);
    assert_eq!(frame.value, vec![1, 2, 3]);
    assert!(frame.timestamp > 0.0);

    // Unsubscribe restores the pre-subscribe state: no residual
    // connection once the last subscriber is gone.
    client.unsubscribe_notifications(&callback_id).await.unwrap();
    assert_eq!(
        daemon.orchestrator.notifications().subscription_count().await,
        0
    );
    assert!(!daemon.orchestrator.notifications().has_connection(MAC).await);

    // Second unsubscribe for the same id is rejected.
    let err = client
        .unsubscribe_notifications(&callback_id)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("InvalidRequest"));

    daemon.stop();
}

#[tokio::test]
async fn test_session_close_sweeps_subscriptions() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.add_device(MAC).await;

    {
        let client = daemon.client().await;
        client
            .subscribe_notifications(MAC, SERVICE, CHAR, None)
            .await
            .expect("subscribe");
        assert_eq!(
            daemon.orchestrator.notifications().subscription_count().await,
            1
        );
        // Client (and its session) dropped here.
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while daemon.orchestrator.notifications().subscription_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session sweep did not run");

    daemon.stop();
}

// ---------------------------------------------------------------------
// Protocol edges
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_malformed_frame_with_request_id_keeps_session() {
    let daemon = TestDaemon::spawn(|_| {}).await;

    let stream = UnixStream::connect(&daemon.socket_path).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // Unknown command, request_id present: error frame, session lives.
    write
        .write_all(b"{\"command\":\"explode\",\"request_id\":\"bad-1\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["status"], serde_json::json!("error"));
    assert_eq!(value["request_id"], serde_json::json!("bad-1"));

    // The same session still answers a valid command.
    write
        .write_all(b"{\"command\":\"get_service_status\",\"request_id\":\"ok-1\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["status"], serde_json::json!("success"));
    assert_eq!(value["request_id"], serde_json::json!("ok-1"));

    daemon.stop();
}

#[tokio::test]
async fn test_invalid_json_closes_session() {
    let daemon = TestDaemon::spawn(|_| {}).await;

    let stream = UnixStream::connect(&daemon.socket_path).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"this is not json\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["status"], serde_json::json!("error"));
    assert!(value.get("request_id").is_none());

    // Server closes the session after the anonymous error.
    let eof = lines.next_line().await.unwrap();
    assert!(eof.is_none());

    daemon.stop();
}

#[tokio::test]
async fn test_queue_full_rejects_low_priority() {
    let daemon = TestDaemon::spawn(|config| {
        config.serial_queue_watermark = 1;
    })
    .await;
    daemon.seed_device(MAC, -55).await;
    daemon.adapter.set_char_value(MAC, CHAR, vec![1]).await;
    daemon.adapter.set_connect_delay(Duration::from_millis(500));

    // Blocker occupies the worker, one NORMAL fills the queue to the
    // watermark.
    let hold1 = {
        let client = daemon.client().await;
        tokio::spawn(async move { client.read_characteristic(MAC, SERVICE, CHAR, None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let hold2 = {
        let client = daemon.client().await;
        tokio::spawn(async move { client.read_characteristic(MAC, SERVICE, CHAR, None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = daemon.client().await;
    let err = client
        .read_characteristic(MAC, SERVICE, CHAR, Some("LOW"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("QueueFull"));

    // HIGH is still admitted above the watermark.
    client
        .read_characteristic(MAC, SERVICE, CHAR, Some("HIGH"), None)
        .await
        .expect("HIGH admitted and served");

    hold1.await.unwrap().unwrap();
    hold2.await.unwrap().unwrap();
    daemon.stop();
}

#[tokio::test]
async fn test_service_status_shape() {
    let daemon = TestDaemon::spawn(|_| {}).await;
    daemon.seed_device(MAC, -55).await;

    let client = daemon.client().await;
    let status = client.status().await.unwrap();
    assert_eq!(status["is_running"], serde_json::json!(true));
    assert_eq!(status["adapter_status"], serde_json::json!("ok"));
    assert_eq!(status["active_devices"], serde_json::json!(1));
    assert_eq!(status["exclusive_control_enabled"], serde_json::json!(true));
    assert!(status["uptime_sec"].as_f64().unwrap() >= 0.0);
    assert!(status["stats"]["total_requests"].as_u64().unwrap() >= 1);

    daemon.stop();
}
