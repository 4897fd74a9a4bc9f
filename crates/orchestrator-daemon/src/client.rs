//! Client for the orchestrator's IPC protocol.
//!
//! Speaks the same line-delimited JSON frames as the daemon, from the
//! other side: typed methods build command frames, a background reader
//! matches response frames to pending calls by `request_id`, and pushed
//! notification frames surface on a channel the caller drains.
//!
//! # Example
//!
//! ```no_run
//! use orchestrator_daemon::client::OrchestratorClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OrchestratorClient::connect_unix("/tmp/ble-orchestrator.sock").await?;
//! let record = client.scan("AA:BB:CC:DD:EE:01").await?;
//! println!("rssi: {}", record["rssi"]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{Mutex, mpsc, oneshot};

use orchestrator_types::{CommandFrame, NotificationFrame, ResponseFrame, WritePayload};

/// How long a call waits for its response frame beyond the request's own
/// timeout budget.
const RESPONSE_GRACE: Duration = Duration::from_secs(35);

/// Errors from client calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not reach or keep the daemon connection.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The daemon answered with an error frame.
    #[error("daemon error: {0}")]
    Api(String),

    /// No response arrived in time (daemon gone or overloaded).
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// Frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type alias for client calls.
pub type Result<T> = std::result::Result<T, ClientError>;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<ResponseFrame>>>>;

/// A connected IPC client.
pub struct OrchestratorClient {
    writer_tx: mpsc::UnboundedSender<String>,
    pending: Pending,
    notifications: Mutex<mpsc::UnboundedReceiver<NotificationFrame>>,
}

impl OrchestratorClient {
    /// Connect over the Unix domain socket.
    pub async fn connect_unix(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read, write) = stream.into_split();
        Ok(Self::from_halves(read, write))
    }

    /// Connect over loopback TCP.
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read, write) = stream.into_split();
        Ok(Self::from_halves(read, write))
    }

    fn from_halves<R, W>(read: R, mut write: W) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if write.write_all(line.as_bytes()).await.is_err()
                    || write.write_all(b"\n").await.is_err()
                    || write.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // Notification pushes and responses share the stream.
                    if let Ok(frame) = serde_json::from_str::<NotificationFrame>(&line) {
                        if frame.kind == "notification" {
                            let _ = notif_tx.send(frame);
                            continue;
                        }
                    }
                    if let Ok(frame) = serde_json::from_str::<ResponseFrame>(&line) {
                        let request_id = match &frame {
                            ResponseFrame::Success { request_id, .. } => Some(request_id.clone()),
                            ResponseFrame::Error { request_id, .. } => request_id.clone(),
                        };
                        if let Some(request_id) = request_id {
                            if let Some(tx) = pending.lock().await.remove(&request_id) {
                                let _ = tx.send(frame);
                            }
                        }
                    }
                }
            });
        }

        Self {
            writer_tx,
            pending,
            notifications: Mutex::new(notif_rx),
        }
    }

    /// Receive the next pushed notification frame.
    pub async fn next_notification(&self) -> Option<NotificationFrame> {
        self.notifications.lock().await.recv().await
    }

    async fn call(&self, frame: CommandFrame) -> Result<serde_json::Value> {
        let request_id = frame.request_id().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let line = serde_json::to_string(&frame)?;
        if self.writer_tx.send(line).is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ClientError::Connection(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "daemon connection closed",
            )));
        }

        match tokio::time::timeout(RESPONSE_GRACE, rx).await {
            Ok(Ok(ResponseFrame::Success { result, .. })) => Ok(result),
            Ok(Ok(ResponseFrame::Error { error, .. })) => Err(ClientError::Api(error)),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ClientError::ResponseTimeout(RESPONSE_GRACE))
            }
        }
    }

    fn request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Look up the newest cached scan record for a device.
    pub async fn scan(&self, mac_address: &str) -> Result<serde_json::Value> {
        self.call(CommandFrame::ScanCommand {
            mac_address: mac_address.to_string(),
            request_id: Self::request_id(),
        })
        .await
    }

    /// Read a characteristic. Returns the byte values from the result.
    pub async fn read_characteristic(
        &self,
        mac_address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        priority: Option<&str>,
        timeout: Option<f64>,
    ) -> Result<serde_json::Value> {
        self.call(CommandFrame::ReadCommand {
            mac_address: mac_address.to_string(),
            service_uuid: service_uuid.to_string(),
            characteristic_uuid: characteristic_uuid.to_string(),
            request_id: Self::request_id(),
            priority: priority.map(str::to_string),
            timeout,
        })
        .await
    }

    /// Write a characteristic.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_characteristic(
        &self,
        mac_address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        data: Vec<u8>,
        response_required: bool,
        priority: Option<&str>,
        timeout: Option<f64>,
    ) -> Result<serde_json::Value> {
        self.call(CommandFrame::SendCommand {
            mac_address: mac_address.to_string(),
            service_uuid: service_uuid.to_string(),
            characteristic_uuid: characteristic_uuid.to_string(),
            data: WritePayload::Bytes(data),
            request_id: Self::request_id(),
            response_required,
            priority: priority.map(str::to_string),
            timeout,
        })
        .await
    }

    /// Subscribe to notifications; returns the callback id to later
    /// unsubscribe with.
    pub async fn subscribe_notifications(
        &self,
        mac_address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        notification_timeout: Option<f64>,
    ) -> Result<String> {
        let result = self
            .call(CommandFrame::SubscribeNotifications {
                mac_address: mac_address.to_string(),
                service_uuid: service_uuid.to_string(),
                characteristic_uuid: characteristic_uuid.to_string(),
                request_id: Self::request_id(),
                callback_id: None,
                notification_timeout,
            })
            .await?;
        result
            .get("callback_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Api("missing callback_id in result".to_string()))
    }

    /// Tear down a subscription.
    pub async fn unsubscribe_notifications(&self, callback_id: &str) -> Result<()> {
        self.call(CommandFrame::UnsubscribeNotifications {
            callback_id: callback_id.to_string(),
            request_id: Self::request_id(),
        })
        .await
        .map(|_| ())
    }

    /// Fetch the daemon status report.
    pub async fn status(&self) -> Result<serde_json::Value> {
        self.call(CommandFrame::GetServiceStatus {
            request_id: Self::request_id(),
        })
        .await
    }
}
