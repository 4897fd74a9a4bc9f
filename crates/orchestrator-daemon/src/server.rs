//! IPC server: line-delimited JSON over a Unix socket or loopback TCP.
//!
//! One JSON object per LF-terminated line in both directions. Each
//! session gets a reader loop (decode, validate, dispatch) and a writer
//! task (responses and pushed notification frames share the socket, so
//! all writes funnel through one channel). Responses are written
//! asynchronously as requests reach their terminal state; a session that
//! disconnects first simply never hears back.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orchestrator_core::Config;
use orchestrator_core::request::{Operation, Request, Response};
use orchestrator_types::{
    CommandFrame, NotificationFrame, RequestPriority, RequestStatus, ResponseFrame, normalize_mac,
};

use crate::service::Orchestrator;

enum Listener {
    Unix(UnixListener, String),
    Tcp(TcpListener),
}

/// The IPC accept loop and its sessions.
pub struct IpcServer {
    orchestrator: Arc<Orchestrator>,
    listener: Listener,
    sessions: Arc<Semaphore>,
}

impl IpcServer {
    /// Bind per the configuration: Unix socket by default, loopback TCP
    /// when selected. A stale socket file is replaced.
    pub async fn bind(config: &Config, orchestrator: Arc<Orchestrator>) -> anyhow::Result<Self> {
        let listener = if config.use_tcp {
            let addr = format!("{}:{}", config.host, config.port);
            let listener = TcpListener::bind(&addr).await?;
            info!("IPC server listening on tcp://{addr}");
            Listener::Tcp(listener)
        } else {
            let path = config.socket_path.clone();
            if std::path::Path::new(&path).exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
            }
            info!("IPC server listening on {path}");
            Listener::Unix(listener, path)
        };

        Ok(Self {
            orchestrator,
            listener,
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
        })
    }

    /// Accept sessions until cancelled, then remove the socket file.
    pub async fn run(self, cancel: CancellationToken) {
        match &self.listener {
            Listener::Unix(listener, path) => {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                let (read, write) = stream.into_split();
                                self.spawn_session(read, write, cancel.clone());
                            }
                            Err(e) => warn!("accept failed: {e}"),
                        },
                    }
                }
                if let Err(e) = std::fs::remove_file(path) {
                    debug!("could not remove socket file: {e}");
                }
            }
            Listener::Tcp(listener) => loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "TCP session");
                            let (read, write) = stream.into_split();
                            self.spawn_session(read, write, cancel.clone());
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    },
                }
            },
        }
        info!("IPC server stopped");
    }

    fn spawn_session<R, W>(&self, read: R, write: W, cancel: CancellationToken)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.sessions).try_acquire_owned() else {
            warn!("session limit reached, dropping new connection");
            return;
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let session_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
            info!(session_id, "client session opened");
            run_session(orchestrator.clone(), &session_id, read, write, cancel).await;
            orchestrator.notifications().remove_session(&session_id).await;
            info!(session_id, "client session closed");
            drop(permit);
        });
    }
}

async fn run_session<R, W>(
    orchestrator: Arc<Orchestrator>,
    session_id: &str,
    read: R,
    mut write: W,
    cancel: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // All frames written to the socket funnel through this channel so
    // responses and notification pushes never interleave mid-line.
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = writer_rx.recv().await {
            if write.write_all(line.as_bytes()).await.is_err()
                || write.write_all(b"\n").await.is_err()
            {
                break;
            }
            if write.flush().await.is_err() {
                break;
            }
        }
    });

    // Notification frames ride the same writer.
    let (notif_tx, mut notif_rx) = mpsc::unbounded_channel::<NotificationFrame>();
    {
        let writer_tx = writer_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = notif_rx.recv().await {
                if let Ok(line) = serde_json::to_string(&frame) {
                    if writer_tx.send(line).is_err() {
                        break;
                    }
                }
            }
        });
    }

    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(session_id, "session read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!(session_id, line = %line, "frame received");

        // Decode in two steps so a malformed frame can still echo its
        // request_id in the error.
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => {
                send_frame(&writer_tx, &ResponseFrame::anonymous_error("Invalid JSON"));
                break;
            }
        };
        let request_id = value
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let frame: CommandFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                match request_id {
                    Some(rid) => {
                        send_frame(
                            &writer_tx,
                            &ResponseFrame::error(rid, format!("InvalidRequest: {e}")),
                        );
                        continue;
                    }
                    None => {
                        send_frame(
                            &writer_tx,
                            &ResponseFrame::anonymous_error(format!("InvalidRequest: {e}")),
                        );
                        break;
                    }
                }
            }
        };

        dispatch(&orchestrator, session_id, frame, &writer_tx, &notif_tx).await;
    }

    // The writer drains and exits once every sender is gone: this one,
    // the in-flight response waiters, and the notification forwarder
    // (whose sinks the session sweep releases). Do not await it here;
    // waiters may still legitimately hold clones.
    drop(writer_tx);
    drop(writer_task);
}

fn send_frame(writer_tx: &mpsc::UnboundedSender<String>, frame: &ResponseFrame) {
    if let Ok(line) = serde_json::to_string(frame) {
        let _ = writer_tx.send(line);
    }
}

fn response_to_frame(response: Response) -> ResponseFrame {
    match response.status {
        RequestStatus::Completed => ResponseFrame::success(
            response.request_id,
            response.result.unwrap_or(serde_json::Value::Null),
        ),
        _ => ResponseFrame::error(
            response.request_id,
            response.error.unwrap_or_else(|| "OperationFailed".to_string()),
        ),
    }
}

/// Admit one decoded frame: build the typed request, enqueue it, and
/// arrange for its terminal response to reach the session.
async fn dispatch(
    orchestrator: &Arc<Orchestrator>,
    session_id: &str,
    frame: CommandFrame,
    writer_tx: &mpsc::UnboundedSender<String>,
    notif_tx: &mpsc::UnboundedSender<NotificationFrame>,
) {
    let request_id = frame.request_id().to_string();

    let (operation, priority, timeout) = match frame {
        CommandFrame::GetServiceStatus { .. } => {
            let report = orchestrator.status().await;
            match serde_json::to_value(report) {
                Ok(value) => send_frame(writer_tx, &ResponseFrame::success(request_id, value)),
                Err(e) => send_frame(writer_tx, &ResponseFrame::error(request_id, e.to_string())),
            }
            return;
        }

        CommandFrame::ScanCommand { mac_address, .. } => {
            let Some(mac) = normalize_or_reject(&mac_address, &request_id, writer_tx) else {
                return;
            };
            (
                Operation::CacheLookup { mac },
                RequestPriority::Normal,
                orchestrator.parallel_lane_timeout(),
            )
        }

        CommandFrame::ReadCommand {
            mac_address,
            service_uuid,
            characteristic_uuid,
            priority,
            timeout,
            ..
        } => {
            let Some(mac) = normalize_or_reject(&mac_address, &request_id, writer_tx) else {
                return;
            };
            (
                Operation::Read {
                    mac,
                    service_uuid,
                    characteristic_uuid,
                },
                parse_priority(priority.as_deref()),
                parse_timeout(timeout, orchestrator.default_request_timeout()),
            )
        }

        CommandFrame::SendCommand {
            mac_address,
            service_uuid,
            characteristic_uuid,
            data,
            response_required,
            priority,
            timeout,
            ..
        } => {
            let Some(mac) = normalize_or_reject(&mac_address, &request_id, writer_tx) else {
                return;
            };
            let payload = match data.decode() {
                Ok(payload) => payload,
                Err(e) => {
                    send_frame(
                        writer_tx,
                        &ResponseFrame::error(request_id, format!("InvalidRequest: {e}")),
                    );
                    return;
                }
            };
            (
                Operation::Write {
                    mac,
                    service_uuid,
                    characteristic_uuid,
                    payload,
                    wants_response: response_required,
                },
                parse_priority(priority.as_deref()),
                parse_timeout(timeout, orchestrator.default_request_timeout()),
            )
        }

        CommandFrame::SubscribeNotifications {
            mac_address,
            service_uuid,
            characteristic_uuid,
            callback_id,
            notification_timeout,
            ..
        } => {
            let Some(mac) = normalize_or_reject(&mac_address, &request_id, writer_tx) else {
                return;
            };
            let callback_id =
                callback_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            // The sink must exist before the subscribe runs so no frame
            // between connect and response is lost.
            orchestrator
                .notifications()
                .register_sink(&callback_id, session_id, notif_tx.clone())
                .await;
            let inactivity = notification_timeout
                .filter(|t| t.is_finite() && *t > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(Duration::ZERO);
            (
                Operation::Subscribe {
                    mac,
                    service_uuid,
                    characteristic_uuid,
                    callback_id,
                    timeout: inactivity,
                },
                RequestPriority::Normal,
                orchestrator.default_request_timeout(),
            )
        }

        CommandFrame::UnsubscribeNotifications { callback_id, .. } => (
            Operation::Unsubscribe { callback_id },
            RequestPriority::Normal,
            orchestrator.default_request_timeout(),
        ),
    };

    let request = Request::new(&request_id, operation, priority, timeout);
    match orchestrator.submit(request).await {
        Ok(receiver) => {
            let writer_tx = writer_tx.clone();
            tokio::spawn(async move {
                if let Ok(response) = receiver.await {
                    send_frame(&writer_tx, &response_to_frame(response));
                }
            });
        }
        Err(e) => {
            // Admission failures (QueueFull above all) answer in-line.
            send_frame(writer_tx, &ResponseFrame::error(request_id, e.reason()));
        }
    }
}

fn normalize_or_reject(
    mac: &str,
    request_id: &str,
    writer_tx: &mpsc::UnboundedSender<String>,
) -> Option<String> {
    match normalize_mac(mac) {
        Ok(canonical) => Some(canonical),
        Err(_) => {
            send_frame(
                writer_tx,
                &ResponseFrame::error(request_id, "InvalidRequest"),
            );
            None
        }
    }
}

fn parse_priority(text: Option<&str>) -> RequestPriority {
    match text {
        Some(text) => RequestPriority::from_wire(text).unwrap_or_default(),
        None => RequestPriority::Normal,
    }
}

fn parse_timeout(secs: Option<f64>, default: Duration) -> Duration {
    secs.filter(|t| t.is_finite() && *t > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::Error;

    #[test]
    fn test_parse_priority_fallback() {
        assert_eq!(parse_priority(Some("HIGH")), RequestPriority::High);
        assert_eq!(parse_priority(Some("bogus")), RequestPriority::Normal);
        assert_eq!(parse_priority(None), RequestPriority::Normal);
    }

    #[test]
    fn test_parse_timeout_guards() {
        let default = Duration::from_secs(10);
        assert_eq!(parse_timeout(Some(2.5), default), Duration::from_secs_f64(2.5));
        assert_eq!(parse_timeout(Some(-1.0), default), default);
        assert_eq!(parse_timeout(Some(f64::NAN), default), default);
        assert_eq!(parse_timeout(None, default), default);
    }

    #[test]
    fn test_response_frame_mapping() {
        let ok = Response::completed("r1", serde_json::json!({"value": [1]}));
        match response_to_frame(ok) {
            ResponseFrame::Success { request_id, result } => {
                assert_eq!(request_id, "r1");
                assert_eq!(result["value"], serde_json::json!([1]));
            }
            other => panic!("wrong frame: {other:?}"),
        }

        let err = Response::failed("r2", &Error::device_not_found("AA"));
        match response_to_frame(err) {
            ResponseFrame::Error { request_id, error } => {
                assert_eq!(request_id.as_deref(), Some("r2"));
                assert_eq!(error, "DeviceNotFound");
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }
}
