//! BLE orchestrator daemon.
//!
//! Wires the engine crate into a resident service and serves the
//! line-delimited JSON IPC protocol on a Unix domain socket (default) or
//! loopback TCP. The [`client`] module speaks the same protocol from the
//! other side and is what the integration tests drive the daemon with.

pub mod client;
pub mod server;
pub mod service;

pub use client::{ClientError, OrchestratorClient};
pub use server::IpcServer;
pub use service::Orchestrator;
