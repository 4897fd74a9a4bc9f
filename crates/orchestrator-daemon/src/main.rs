//! BLE Orchestrator - resident BLE arbitration daemon.
//!
//! Runs in the foreground until SIGINT/SIGTERM. All configuration comes
//! from environment variables; see the crate README for the full table.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use orchestrator_core::{BtleAdapter, Config, ShellHostControl};
use orchestrator_daemon::{IpcServer, Orchestrator};

/// BLE Orchestrator - serializes access to the host BLE stack for
/// multiple client processes.
#[derive(Parser, Debug)]
#[command(name = "ble-orchestrator")]
#[command(version, about, long_about = None)]
struct Args {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args {} = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("configuration: {e}");
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    info!(
        scan_adapter = %config.scan_adapter,
        connect_adapter = %config.connect_adapter,
        "starting ble-orchestrator"
    );

    let adapter = Arc::new(
        BtleAdapter::new(&config.scan_adapter, &config.connect_adapter)
            .await
            .map_err(|e| anyhow::anyhow!("Bluetooth adapter setup failed: {e}"))?,
    );
    let host = Arc::new(ShellHostControl::new());

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), adapter, host));
    orchestrator.start().await;

    let server = IpcServer::bind(&config, Arc::clone(&orchestrator)).await?;
    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(cancel.clone()));

    shutdown_signal().await;
    info!("shutdown signal received");

    cancel.cancel();
    let _ = server_task.await;
    orchestrator.stop().await;

    info!("graceful shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
