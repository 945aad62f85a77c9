//! Invoicing Domain Ports
//!
//! The invoicing services reach everything outside the domain through the
//! traits in this module:
//!
//! - [`InvoiceStore`]: invoice tree persistence with atomic, version-checked
//!   [`ChangeSet`] commits (PostgreSQL in `infra_db`, in-memory in [`mock`])
//! - [`PartyDirectory`]: companies and platform administrators
//! - [`PaymentGateway`]: payment intents, charges, transfers, external invoices
//! - [`NotificationGateway`]: delivery of one planned notification
//!
//! # Optimistic concurrency
//!
//! Every record carries a `version`. A record placed in
//! [`ChangeSet::update`] holds the version that was read; the store accepts the
//! whole change set only if every such version is still current, then stores
//! each updated record with `version + 1`. Inserted records must not exist yet.
//! Any miss rejects the entire change set with `PortError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use core_kernel::{
    CompanyId, DisputeId, DomainPort, DriverInvoiceId, JobId, JobInvoiceId, LateFeeInvoiceId,
    ManualPaymentId, Money, OwnerInvoiceId, PortError,
};

use crate::dispute::DisputeInvoice;
use crate::invoice::{DriverJobInvoice, JobInvoice, OwnerJobInvoice};
use crate::job::Job;
use crate::late_fee::LateFeeInvoice;
use crate::notifications::Notification;
use crate::party::{Admin, Company};
use crate::payment::{ManualPayment, PaymentTarget};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Any persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Job(Job),
    JobInvoice(JobInvoice),
    OwnerInvoice(OwnerJobInvoice),
    DriverInvoice(DriverJobInvoice),
    Dispute(DisputeInvoice),
    LateFee(LateFeeInvoice),
    ManualPayment(ManualPayment),
}

impl Record {
    /// Entity name used in errors and as the storage kind
    pub fn entity_name(&self) -> &'static str {
        match self {
            Record::Job(_) => "Job",
            Record::JobInvoice(_) => "JobInvoice",
            Record::OwnerInvoice(_) => "OwnerJobInvoice",
            Record::DriverInvoice(_) => "DriverJobInvoice",
            Record::Dispute(_) => "DisputeInvoice",
            Record::LateFee(_) => "LateFeeInvoice",
            Record::ManualPayment(_) => "ManualPayment",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Record::Job(r) => *r.id.as_uuid(),
            Record::JobInvoice(r) => *r.id.as_uuid(),
            Record::OwnerInvoice(r) => *r.id.as_uuid(),
            Record::DriverInvoice(r) => *r.id.as_uuid(),
            Record::Dispute(r) => *r.id.as_uuid(),
            Record::LateFee(r) => *r.id.as_uuid(),
            Record::ManualPayment(r) => *r.id.as_uuid(),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Record::Job(r) => r.version,
            Record::JobInvoice(r) => r.version,
            Record::OwnerInvoice(r) => r.version,
            Record::DriverInvoice(r) => r.version,
            Record::Dispute(r) => r.version,
            Record::LateFee(r) => r.version,
            Record::ManualPayment(r) => r.version,
        }
    }

    /// Returns the record as it is stored after a successful update
    pub fn into_next_version(mut self) -> Self {
        match &mut self {
            Record::Job(r) => r.version += 1,
            Record::JobInvoice(r) => r.version += 1,
            Record::OwnerInvoice(r) => r.version += 1,
            Record::DriverInvoice(r) => r.version += 1,
            Record::Dispute(r) => r.version += 1,
            Record::LateFee(r) => r.version += 1,
            Record::ManualPayment(r) => r.version += 1,
        }
        self
    }
}

macro_rules! impl_into_record {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Record {
                fn from(record: $ty) -> Self {
                    Record::$variant(record)
                }
            }
        )*
    };
}

impl_into_record!(
    Job => Job,
    JobInvoice => JobInvoice,
    OwnerJobInvoice => OwnerInvoice,
    DriverJobInvoice => DriverInvoice,
    DisputeInvoice => Dispute,
    LateFeeInvoice => LateFee,
    ManualPayment => ManualPayment,
);

/// A unit of work committed atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    inserts: Vec<Record>,
    updates: Vec<Record>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: impl Into<Record>) -> &mut Self {
        self.inserts.push(record.into());
        self
    }

    /// Stages an update guarded by the record's current `version`
    pub fn update(&mut self, record: impl Into<Record>) -> &mut Self {
        self.updates.push(record.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len()
    }

    pub fn inserts(&self) -> &[Record] {
        &self.inserts
    }

    pub fn updates(&self) -> &[Record] {
        &self.updates
    }

    pub fn into_parts(self) -> (Vec<Record>, Vec<Record>) {
        (self.inserts, self.updates)
    }
}

/// Persistence port for the invoice tree
///
/// Reads return fully hydrated records. All writes go through [`commit`].
///
/// [`commit`]: InvoiceStore::commit
#[async_trait]
pub trait InvoiceStore: DomainPort {
    async fn get_job(&self, id: JobId) -> Result<Job, PortError>;

    async fn get_job_invoice(&self, id: JobInvoiceId) -> Result<JobInvoice, PortError>;

    async fn get_owner_invoice(&self, id: OwnerInvoiceId) -> Result<OwnerJobInvoice, PortError>;

    async fn get_driver_invoice(&self, id: DriverInvoiceId) -> Result<DriverJobInvoice, PortError>;

    async fn get_dispute(&self, id: DisputeId) -> Result<DisputeInvoice, PortError>;

    async fn get_late_fee(&self, id: LateFeeInvoiceId) -> Result<LateFeeInvoice, PortError>;

    async fn get_manual_payment(&self, id: ManualPaymentId) -> Result<ManualPayment, PortError>;

    /// Every job invoice generated for a job, across dispute depths
    async fn job_invoices_for_job(&self, job_id: JobId) -> Result<Vec<JobInvoice>, PortError>;

    async fn owner_invoices_for_job_invoice(
        &self,
        job_invoice_id: JobInvoiceId,
    ) -> Result<Vec<OwnerJobInvoice>, PortError>;

    /// Tickets under an owner invoice, ordered by ticket number
    async fn driver_invoices_for_owner_invoice(
        &self,
        owner_invoice_id: OwnerInvoiceId,
    ) -> Result<Vec<DriverJobInvoice>, PortError>;

    /// The job invoice with the highest `curr_dispute` under a base order number
    async fn latest_job_invoice_by_order(
        &self,
        order_number: &str,
    ) -> Result<Option<JobInvoice>, PortError>;

    /// The owner invoice with the highest `curr_dispute` under an owner order number
    async fn latest_owner_invoice_by_order(
        &self,
        owner_order_number: &str,
    ) -> Result<Option<OwnerJobInvoice>, PortError>;

    /// Late fees of a job invoice, oldest first
    async fn late_fees_for_job_invoice(
        &self,
        job_invoice_id: JobInvoiceId,
    ) -> Result<Vec<LateFeeInvoice>, PortError>;

    /// Unpaid, non-cancelled job invoices with `due_date < now`
    async fn overdue_job_invoices(&self, now: DateTime<Utc>) -> Result<Vec<JobInvoice>, PortError>;

    /// Unpaid, non-cancelled job invoices with `from <= due_date < to`
    async fn unpaid_job_invoices_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobInvoice>, PortError>;

    /// Unpaid owner invoices missing acceptance from at least one side
    async fn owner_invoices_pending_acceptance(&self) -> Result<Vec<OwnerJobInvoice>, PortError>;

    /// Unpaid owner invoices without a transfer whose job invoice is paid and
    /// whose own due date has passed
    async fn owner_invoices_awaiting_payout(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OwnerJobInvoice>, PortError>;

    async fn job_invoice_by_payment_intent(&self, intent_id: &str) -> Result<Option<JobInvoice>, PortError>;

    async fn job_invoice_by_external_invoice(
        &self,
        external_invoice_id: &str,
    ) -> Result<Option<JobInvoice>, PortError>;

    async fn late_fee_by_charge(&self, charge_id: &str) -> Result<Option<LateFeeInvoice>, PortError>;

    async fn owner_invoice_by_transfer(&self, transfer_id: &str) -> Result<Option<OwnerJobInvoice>, PortError>;

    /// Manual payment claims against an invoice, oldest first
    async fn manual_payments_for(&self, target: PaymentTarget) -> Result<Vec<ManualPayment>, PortError>;

    /// Next value of the global dispute number sequence
    async fn next_dispute_number(&self) -> Result<u64, PortError>;

    /// Applies a change set atomically
    ///
    /// # Errors
    ///
    /// `PortError::Conflict` if any updated record's version is stale or any
    /// inserted record already exists; nothing is written in that case.
    async fn commit(&self, changes: ChangeSet) -> Result<(), PortError>;
}

/// Read access to companies and administrators
#[async_trait]
pub trait PartyDirectory: DomainPort {
    async fn company(&self, id: CompanyId) -> Result<Company, PortError>;

    async fn admins(&self) -> Result<Vec<Admin>, PortError>;
}

/// Failures reported by the payment gateway
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Balance insufficient: {0}")]
    BalanceInsufficient(String),

    #[error("Bank account not verified: {0}")]
    UnverifiedBankAccount(String),

    #[error("Declined: {0}")]
    Declined(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    Card,
    Bank,
}

/// The paying contractor as known to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub company_id: CompanyId,
    pub email: Option<String>,
    /// Gateway customer id from a previous checkout
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub customer_id: String,
}

/// Payment rail operations
#[async_trait]
pub trait PaymentGateway: DomainPort {
    async fn create_payment_intent(
        &self,
        amount: Money,
        reference: &str,
        payer: &Payer,
        channel: PaymentChannel,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Returns the charge id
    async fn create_charge(
        &self,
        amount: Money,
        reference: &str,
        payer: &Payer,
        channel: PaymentChannel,
    ) -> Result<String, GatewayError>;

    /// Returns the transfer id; `idempotency_key` makes retries safe
    async fn create_transfer(
        &self,
        amount: Money,
        destination: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError>;

    /// Returns the gateway's invoice id
    async fn create_invoice(&self, invoice: &JobInvoice) -> Result<String, GatewayError>;
}

/// Delivery of a single planned notification
#[async_trait]
pub trait NotificationGateway: DomainPort {
    async fn deliver(&self, notification: &Notification) -> Result<(), PortError>;
}
