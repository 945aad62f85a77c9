//! Service wiring and inbound event routing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use core_kernel::JobId;

use crate::acceptance::AcceptanceTracker;
use crate::cash_advance::CashAdvanceWorkflow;
use crate::dispute::DisputeResolutionEngine;
use crate::error::InvoicingError;
use crate::generator::{GenerationReport, InvoiceGenerator};
use crate::late_fee::LateFeeScheduler;
use crate::notifications::NotificationDispatcher;
use crate::payout::PayoutService;
use crate::policy::BillingPolicy;
use crate::ports::{InvoiceStore, NotificationGateway, PartyDirectory, PaymentGateway};
use crate::reconciliation::{PaymentReconciler, ReconcileOutcome};

/// Events delivered to the invoicing core by the job lifecycle and the
/// payment rail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InboundEvent {
    JobFinished { job_id: JobId },
    IntentPaid { intent_id: String },
    InvoicePaid { invoice_id: String },
    ChargePaid { charge_id: String },
    ChargePending { charge_id: String },
    TransferPaid { transfer_id: String },
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::JobFinished { .. } => "jobFinished",
            InboundEvent::IntentPaid { .. } => "intentPaid",
            InboundEvent::InvoicePaid { .. } => "invoicePaid",
            InboundEvent::ChargePaid { .. } => "chargePaid",
            InboundEvent::ChargePending { .. } => "chargePending",
            InboundEvent::TransferPaid { .. } => "transferPaid",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Generated(GenerationReport),
    Reconciled(ReconcileOutcome),
}

/// The adapters the invoicing services run against
#[derive(Clone)]
pub struct EnginePorts {
    pub store: Arc<dyn InvoiceStore>,
    pub directory: Arc<dyn PartyDirectory>,
    pub payments: Arc<dyn PaymentGateway>,
    pub notifications: Arc<dyn NotificationGateway>,
}

/// Every invoicing service, wired to one set of ports and one policy
pub struct InvoicingEngine {
    generator: InvoiceGenerator,
    acceptance: AcceptanceTracker,
    disputes: DisputeResolutionEngine,
    late_fees: LateFeeScheduler,
    cash_advances: CashAdvanceWorkflow,
    payouts: PayoutService,
    reconciler: PaymentReconciler,
}

impl InvoicingEngine {
    pub fn new(ports: EnginePorts, policy: BillingPolicy) -> Self {
        let dispatcher = NotificationDispatcher::new(ports.notifications.clone());
        let payouts = PayoutService::new(
            ports.store.clone(),
            ports.directory.clone(),
            ports.payments.clone(),
            policy.clone(),
        );

        Self {
            generator: InvoiceGenerator::new(
                ports.store.clone(),
                ports.directory.clone(),
                ports.payments.clone(),
                dispatcher.clone(),
                policy.clone(),
            ),
            acceptance: AcceptanceTracker::new(ports.store.clone(), policy.clone()),
            disputes: DisputeResolutionEngine::new(
                ports.store.clone(),
                ports.directory.clone(),
                dispatcher.clone(),
                policy.clone(),
            ),
            late_fees: LateFeeScheduler::new(
                ports.store.clone(),
                ports.directory.clone(),
                dispatcher.clone(),
                policy.clone(),
            ),
            cash_advances: CashAdvanceWorkflow::new(
                ports.store.clone(),
                ports.directory.clone(),
                payouts.clone(),
                dispatcher,
                policy,
            ),
            payouts,
            reconciler: PaymentReconciler::new(ports.store, ports.payments),
        }
    }

    pub fn generator(&self) -> &InvoiceGenerator {
        &self.generator
    }

    pub fn acceptance(&self) -> &AcceptanceTracker {
        &self.acceptance
    }

    pub fn disputes(&self) -> &DisputeResolutionEngine {
        &self.disputes
    }

    pub fn late_fees(&self) -> &LateFeeScheduler {
        &self.late_fees
    }

    pub fn cash_advances(&self) -> &CashAdvanceWorkflow {
        &self.cash_advances
    }

    pub fn payouts(&self) -> &PayoutService {
        &self.payouts
    }

    pub fn reconciler(&self) -> &PaymentReconciler {
        &self.reconciler
    }

    /// Routes an inbound event to the service that owns it
    #[instrument(skip_all, fields(event = event.name()))]
    pub async fn handle(&self, event: InboundEvent, now: DateTime<Utc>) -> Result<EventOutcome, InvoicingError> {
        let outcome = match event {
            InboundEvent::JobFinished { job_id } => {
                EventOutcome::Generated(self.generator.generate(job_id, now).await?)
            }
            InboundEvent::IntentPaid { intent_id } => {
                EventOutcome::Reconciled(self.reconciler.intent_paid(&intent_id, now).await?)
            }
            InboundEvent::InvoicePaid { invoice_id } => {
                EventOutcome::Reconciled(self.reconciler.invoice_paid(&invoice_id, now).await?)
            }
            InboundEvent::ChargePaid { charge_id } => {
                EventOutcome::Reconciled(self.reconciler.charge_paid(&charge_id, now).await?)
            }
            InboundEvent::ChargePending { charge_id } => {
                EventOutcome::Reconciled(self.reconciler.charge_pending(&charge_id, now).await?)
            }
            InboundEvent::TransferPaid { transfer_id } => {
                EventOutcome::Reconciled(self.reconciler.transfer_paid(&transfer_id, now).await?)
            }
        };
        info!(outcome = outcome_label(&outcome), "Inbound event handled");
        Ok(outcome)
    }
}

fn outcome_label(outcome: &EventOutcome) -> &'static str {
    match outcome {
        EventOutcome::Generated(_) => "generated",
        EventOutcome::Reconciled(ReconcileOutcome::Applied) => "applied",
        EventOutcome::Reconciled(ReconcileOutcome::Duplicate) => "duplicate",
    }
}
