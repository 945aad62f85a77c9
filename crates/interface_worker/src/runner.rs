//! Sweep scheduling and inbound event handling

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use domain_invoicing::{EventOutcome, InboundEvent, InvoicingEngine, InvoicingError, SweepReport};

use crate::config::SweepCadence;
use crate::error::WorkerError;

/// The scheduled sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    LateFees,
    AutoAccept,
    Transfers,
    DueReminders,
}

impl Sweep {
    pub const ALL: [Sweep; 4] = [Sweep::LateFees, Sweep::AutoAccept, Sweep::Transfers, Sweep::DueReminders];

    pub fn name(&self) -> &'static str {
        match self {
            Sweep::LateFees => "late_fees",
            Sweep::AutoAccept => "auto_accept",
            Sweep::Transfers => "transfers",
            Sweep::DueReminders => "due_reminders",
        }
    }

    fn period(&self, cadence: &SweepCadence) -> Duration {
        match self {
            Sweep::LateFees => cadence.late_fee(),
            Sweep::AutoAccept => cadence.auto_accept(),
            Sweep::Transfers => cadence.transfer(),
            Sweep::DueReminders => cadence.reminder(),
        }
    }
}

/// Drives an [`InvoicingEngine`] from timers and an event stream
#[derive(Clone)]
pub struct Worker {
    engine: Arc<InvoicingEngine>,
}

impl Worker {
    pub fn new(engine: Arc<InvoicingEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &InvoicingEngine {
        &self.engine
    }

    /// Runs one sweep at `now`
    pub async fn run_sweep(&self, sweep: Sweep, now: DateTime<Utc>) -> Result<SweepReport, InvoicingError> {
        let report = match sweep {
            Sweep::LateFees => self.engine.late_fees().run(now).await?,
            Sweep::AutoAccept => self.engine.acceptance().run_auto_accept_sweep(now).await?,
            Sweep::Transfers => self.engine.payouts().run_transfer_sweep(now).await?,
            Sweep::DueReminders => self.engine.late_fees().send_due_reminders(now).await?,
        };
        info!(
            sweep = sweep.name(),
            examined = report.examined,
            changed = report.changed,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Runs every sweep once, in a fixed order
    pub async fn run_all_sweeps(&self, now: DateTime<Utc>) -> SweepReport {
        let mut total = SweepReport::default();
        for sweep in Sweep::ALL {
            match self.run_sweep(sweep, now).await {
                Ok(report) => total.merge(report),
                Err(e) => error!(sweep = sweep.name(), error = %e, "Sweep aborted"),
            }
        }
        total
    }

    /// Starts one interval task per sweep
    pub fn spawn_sweeps(&self, cadence: &SweepCadence) -> Vec<JoinHandle<()>> {
        Sweep::ALL
            .into_iter()
            .map(|sweep| {
                let worker = self.clone();
                let period = sweep.period(cadence);
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        interval.tick().await;
                        if let Err(e) = worker.run_sweep(sweep, Utc::now()).await {
                            error!(sweep = sweep.name(), error = %e, "Sweep aborted");
                        }
                    }
                })
            })
            .collect()
    }

    /// Parses one JSON event and routes it to the engine
    pub async fn handle_line(&self, line: &str, now: DateTime<Utc>) -> Result<EventOutcome, WorkerError> {
        let event: InboundEvent = serde_json::from_str(line)?;
        Ok(self.engine.handle(event, now).await?)
    }

    /// Consumes newline-delimited events until the reader ends or `shutdown` fires
    ///
    /// A bad line is logged and skipped. Returns the number of events handled.
    pub async fn consume_events<R, S>(&self, reader: R, shutdown: S) -> Result<usize, WorkerError>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = reader.lines();
        let mut handled = 0;
        tokio::pin!(shutdown);

        loop {
            let line = tokio::select! {
                _ = &mut shutdown => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match self.handle_line(&line, Utc::now()).await {
                Ok(_) => handled += 1,
                Err(WorkerError::Invoicing(e)) if e.is_retryable() => {
                    warn!(error = %e, "Inbound event failed, retry by re-sending it");
                }
                Err(e) => error!(error = %e, "Inbound event rejected"),
            }
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain_invoicing::fixtures::{self, Harness};
    use domain_invoicing::{EnginePorts, InvoiceStore};

    fn worker_for(harness: &Harness) -> Worker {
        let engine = InvoicingEngine::new(
            EnginePorts {
                store: harness.store.clone(),
                directory: harness.directory.clone(),
                payments: harness.payments.clone(),
                notifications: harness.notifications.clone(),
            },
            harness.policy.clone(),
        );
        Worker::new(Arc::new(engine))
    }

    #[tokio::test]
    async fn test_handle_line_generates_invoices() {
        let harness = Harness::with_simple_hourly_job().await;
        let worker = worker_for(&harness);
        let line = serde_json::to_string(&InboundEvent::JobFinished { job_id: harness.job_id }).unwrap();

        let outcome = worker.handle_line(&line, fixtures::now()).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Generated(_)));
    }

    #[tokio::test]
    async fn test_malformed_line_is_rejected() {
        let harness = Harness::with_simple_hourly_job().await;
        let worker = worker_for(&harness);
        let err = worker.handle_line("{not json", fixtures::now()).await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn test_consume_events_skips_bad_lines() {
        let harness = Harness::generated_simple_hourly_job().await;
        let worker = worker_for(&harness);
        let external = harness.job_invoice().await.external_invoice_id.unwrap();
        let input = format!(
            "{}\n\nnot-an-event\n{}\n",
            serde_json::json!({ "type": "invoicePaid", "invoiceId": external }),
            serde_json::json!({ "type": "transferPaid", "transferId": "tr_unknown" }),
        );

        let handled = worker
            .consume_events(input.as_bytes(), std::future::pending())
            .await
            .unwrap();
        assert_eq!(handled, 1);
        assert!(harness.job_invoice().await.is_paid);
    }

    #[tokio::test]
    async fn test_all_sweeps_run_on_generated_job() {
        let harness = Harness::generated_simple_hourly_job().await;
        let worker = worker_for(&harness);
        let invoice = harness.job_invoice().await;

        let report = worker.run_all_sweeps(invoice.due_date + chrono::Duration::hours(1)).await;
        assert_eq!(report.failed, 0);

        let fees = harness.store.late_fees_for_job_invoice(invoice.id).await.unwrap();
        assert_eq!(fees.len(), 1);
        let owner = harness.owner_invoices().await.remove(0);
        assert!(owner.is_fully_accepted());
    }
}
