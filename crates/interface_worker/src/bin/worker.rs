//! Invoicing worker binary
//!
//! # Usage
//!
//! ```bash
//! WORKER_DATABASE_URL=postgres://... cargo run --bin invoicing-worker < events.ndjson
//! ```
//!
//! # Environment Variables
//!
//! * `WORKER_DATABASE_URL` - PostgreSQL connection string
//! * `WORKER_MAX_CONNECTIONS` - Pool size (default: 10)
//! * `WORKER_LOG_LEVEL` - Log level when `RUST_LOG` is unset (default: info)
//! * `WORKER_READ_EVENTS_FROM_STDIN` - Consume inbound events from stdin (default: true)
//! * `WORKER_SWEEPS__<SWEEP>_SECS` - Sweep cadences
//! * `WORKER_POLICY__<FIELD>` - Billing policy overrides

use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use domain_invoicing::{EnginePorts, InvoicingEngine};
use infra_db::{create_pool, run_migrations, DatabaseConfig, PgInvoiceStore, PgPartyDirectory};
use interface_worker::{DisabledPaymentGateway, LoggingNotificationGateway, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    init_tracing(&config.log_level);

    tracing::info!(
        max_connections = config.max_connections,
        stdin_events = config.read_events_from_stdin,
        "Starting invoicing worker"
    );

    let pool = create_pool(DatabaseConfig::new(&config.database_url).max_connections(config.max_connections))
        .await
        .context("connecting to database")?;
    run_migrations(&pool).await.context("applying migrations")?;

    let engine = InvoicingEngine::new(
        EnginePorts {
            store: Arc::new(PgInvoiceStore::new(pool.clone())),
            directory: Arc::new(PgPartyDirectory::new(pool)),
            payments: Arc::new(DisabledPaymentGateway),
            notifications: Arc::new(LoggingNotificationGateway),
        },
        config.policy.clone(),
    );
    let worker = Worker::new(Arc::new(engine));
    let sweeps = worker.spawn_sweeps(&config.sweeps);

    if config.read_events_from_stdin {
        let stdin = BufReader::new(tokio::io::stdin());
        let handled = worker.consume_events(stdin, shutdown_signal()).await?;
        tracing::info!(handled, "Inbound event stream closed");
    }
    shutdown_signal().await;

    for task in sweeps {
        task.abort();
    }
    tracing::info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Waits for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
