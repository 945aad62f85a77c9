//! Worker error handling

use thiserror::Error;

use core_kernel::CoreError;
use domain_invoicing::InvoicingError;
use infra_db::DatabaseError;

/// Worker error types
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid billing policy: {0}")]
    InvalidPolicy(CoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invoicing error: {0}")]
    Invoicing(#[from] InvoicingError),

    #[error("Malformed inbound event: {0}")]
    MalformedEvent(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
