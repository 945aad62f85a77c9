//! Invoicing Domain - Job, owner and driver invoices for haulage work
//!
//! A finished job is billed as a three-tier tree:
//! - **Job invoice**: what the contractor pays for the whole job
//! - **Owner invoices**: one per truck-owner company, net of the platform fee
//! - **Driver job invoices** ("tickets"): one per clocked assignment
//!
//! Around that tree the crate tracks two-sided acceptance, dispute
//! resolution (which re-issues a fresh tree and never edits the disputed
//! one), late fees, owner cash advances, payouts and the reconciliation of
//! payment-rail callbacks.
//!
//! Every service works against the ports in [`ports`]; `infra_db` provides
//! the Postgres store and the `mock` feature provides in-memory adapters.
//!
//! # Example
//!
//! ```rust,ignore
//! use domain_invoicing::{EnginePorts, InboundEvent, InvoicingEngine, BillingPolicy};
//!
//! let engine = InvoicingEngine::new(ports, BillingPolicy::default());
//! engine.handle(InboundEvent::JobFinished { job_id }, Utc::now()).await?;
//! engine.late_fees().run(Utc::now()).await?;
//! ```

pub mod acceptance;
pub mod cash_advance;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod generator;
pub mod invoice;
pub mod job;
pub mod late_fee;
pub mod ledger;
pub mod notifications;
pub mod party;
pub mod payment;
pub mod payout;
pub mod policy;
pub mod ports;
pub mod pricing;
pub mod reconciliation;
pub mod sweep;

#[cfg(any(test, feature = "mock"))]
pub mod fixtures;

pub use acceptance::AcceptanceTracker;
pub use cash_advance::{cash_advance_amount, CashAdvanceWorkflow};
pub use dispute::{
    AdjustedFigures, DisputeInvoice, DisputeOutcome, DisputeResolution, DisputeResolutionEngine,
    DisputeStatus, OpenDisputeRequest, RequesterRole, ResolutionReport,
};
pub use engine::{EnginePorts, EventOutcome, InboundEvent, InvoicingEngine};
pub use error::InvoicingError;
pub use generator::{build_invoice_tree, ExternalInvoiceOutcome, GenerationReport, InvoiceGenerator, InvoiceTree};
pub use invoice::{
    AcceptingParty, Actor, DriverJobInvoice, InvoiceEvent, InvoiceEventKind, InvoiceStatus, JobInvoice,
    OwnerJobInvoice, Payable, PaymentMethod,
};
pub use job::{Assignment, Job, LoadEvent, ScheduledJob, TimeEntry};
pub use late_fee::{LateFeeInvoice, LateFeeScheduler};
pub use ledger::TicketLedger;
pub use notifications::{Channel, Notification, NotificationDispatcher, Topic};
pub use party::{Admin, Company, Contact};
pub use payment::{ManualPayment, ManualPaymentRequest, PaymentTarget};
pub use payout::PayoutService;
pub use policy::BillingPolicy;
pub use ports::{ChangeSet, InvoiceStore, NotificationGateway, PartyDirectory, PaymentGateway, Record};
pub use pricing::{calculate_amount, CommodityKind, Quantities};
pub use reconciliation::{PaymentReconciler, ReconcileOutcome};
pub use sweep::SweepReport;
