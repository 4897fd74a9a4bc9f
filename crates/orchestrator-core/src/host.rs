//! Host-level administrative control of BLE adapters.
//!
//! The recovery ladder needs operations the BLE API does not offer:
//! bouncing an adapter, resetting it, restarting the Bluetooth service.
//! Those run as host commands (`hciconfig`, `systemctl`) and usually need
//! elevated privileges. A privilege failure is reported as an error for
//! the watchdog to log and skip; it must never take the service down.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Observed state of a host adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    UpRunning,
    Down,
    NotFound,
    Unknown,
}

/// Administrative operations on the host Bluetooth stack.
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Bring an adapter down and back up (lightweight reset).
    async fn adapter_down_up(&self, adapter: &str) -> Result<()>;

    /// Issue a full reset on an adapter.
    async fn adapter_reset(&self, adapter: &str) -> Result<()>;

    /// Restart the host Bluetooth service.
    async fn restart_stack(&self) -> Result<()>;

    /// Query an adapter's state.
    async fn adapter_status(&self, adapter: &str) -> Result<AdapterState>;
}

/// [`HostControl`] backed by `hciconfig` and `systemctl`.
///
/// Commands run without a privilege wrapper; when the daemon lacks the
/// needed capability the command fails with a non-zero exit and the error
/// propagates to the watchdog, which logs and skips the step.
#[derive(Debug, Default)]
pub struct ShellHostControl;

impl ShellHostControl {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("running host command: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                "host command '{} {}' failed ({}): {}",
                program,
                args.join(" "),
                output.status,
                stderr
            );
            Err(Error::OperationFailed(format!(
                "{program} exited with {}: {stderr}",
                output.status
            )))
        }
    }
}

#[async_trait]
impl HostControl for ShellHostControl {
    async fn adapter_down_up(&self, adapter: &str) -> Result<()> {
        self.run("hciconfig", &[adapter, "down"]).await?;
        self.run("hciconfig", &[adapter, "up"]).await?;
        Ok(())
    }

    async fn adapter_reset(&self, adapter: &str) -> Result<()> {
        self.run("hciconfig", &[adapter, "reset"]).await?;
        Ok(())
    }

    async fn restart_stack(&self) -> Result<()> {
        self.run("systemctl", &["restart", "bluetooth"]).await?;
        Ok(())
    }

    async fn adapter_status(&self, adapter: &str) -> Result<AdapterState> {
        let output = match self.run("hciconfig", &[adapter]).await {
            Ok(out) => out,
            Err(_) => return Ok(AdapterState::Unknown),
        };

        if output.contains("UP RUNNING") {
            Ok(AdapterState::UpRunning)
        } else if output.contains("DOWN") {
            Ok(AdapterState::Down)
        } else if output.contains("No such device") {
            Ok(AdapterState::NotFound)
        } else {
            Ok(AdapterState::Unknown)
        }
    }
}
