//! Invoicing Worker
//!
//! Hosts the invoicing engine in a long-running process:
//! - Scheduled sweeps (late fees, auto-acceptance, owner transfers, due
//!   reminders), each on its own interval
//! - Newline-delimited JSON inbound events (job finished, payment-rail
//!   callbacks) routed to the engine
//!
//! Configuration comes from `WORKER_`-prefixed environment variables, see
//! [`config::WorkerConfig`].

pub mod config;
pub mod error;
pub mod gateways;
pub mod runner;

pub use config::{SweepCadence, WorkerConfig};
pub use error::WorkerError;
pub use gateways::{DisabledPaymentGateway, LoggingNotificationGateway};
pub use runner::{Sweep, Worker};
