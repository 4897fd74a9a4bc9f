//! BLE arbitration engine.
//!
//! This crate is the core of the BLE orchestrator: a resident service
//! that serializes access to the host's Bluetooth Low Energy stack on
//! behalf of unrelated client processes. Concurrent use of the stack
//! from several processes hangs adapters and drops connections; the
//! orchestrator makes itself the only process that talks to it.
//!
//! # Architecture
//!
//! - [`adapter`]: the facade every BLE primitive goes through
//!   ([`btle`] in production, [`mock`] in tests)
//! - [`cache`]: TTL-bounded advertisement history per device
//! - [`coordinator`]: scanner/client exclusive-control handoff
//! - [`scanner`]: continuous background scanning with stall repair
//! - [`scheduler`]: priority queue, two execution lanes, deadlines
//! - [`handler`]: executes one BLE operation end to end
//! - [`watchdog`]: failure counters and the recovery ladder
//! - [`notifications`]: long-lived connections and notification fan-out
//!
//! The daemon crate wires these together and serves the IPC protocol;
//! everything here is testable in-process against the mock adapter.

pub mod adapter;
pub mod btle;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod host;
pub mod ledger;
pub mod mock;
pub mod notifications;
pub mod request;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod watchdog;

pub use adapter::{BleAdapter, BleConnection};
pub use btle::BtleAdapter;
pub use cache::ScanCache;
pub use config::{Config, ValidationError};
pub use coordinator::Coordinator;
pub use error::{ConnectionFailureReason, Error, Result};
pub use handler::RequestHandler;
pub use host::{AdapterState, HostControl, ShellHostControl};
pub use ledger::FailureLedger;
pub use mock::{MockAdapter, MockHostControl};
pub use notifications::NotificationManager;
pub use request::{Operation, Request, Response};
pub use retry::{RetryConfig, with_retry};
pub use scanner::{Scanner, ScannerHandle};
pub use scheduler::{RequestExecutor, Scheduler, SchedulerOptions};
pub use watchdog::{FailureSignal, Watchdog, WatchdogOptions};
