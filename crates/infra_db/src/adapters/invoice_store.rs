//! PostgreSQL Invoice Store Adapter
//!
//! Implements [`InvoiceStore`] over the `invoicing_records` JSONB table.
//! Lookups filter on fields of the stored document; [`InvoiceStore::commit`]
//! maps onto [`RecordRepository::apply`], so a change set is written in one
//! transaction with every version checked.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::adapters::PgInvoiceStore;
//! use domain_invoicing::InvoiceStore;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn InvoiceStore> = Arc::new(PgInvoiceStore::new(pool));
//! let invoice = store.get_job_invoice(id).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};

use core_kernel::{
    DisputeId, DomainPort, DriverInvoiceId, JobId, JobInvoiceId, LateFeeInvoiceId, ManualPaymentId,
    OwnerInvoiceId, PortError,
};
use domain_invoicing::{
    ChangeSet, DisputeInvoice, DriverJobInvoice, InvoiceStore, Job, JobInvoice, LateFeeInvoice, ManualPayment,
    OwnerJobInvoice, PaymentTarget,
};

use crate::error::DatabaseError;
use crate::repositories::{RecordRepository, StoredRecord};

const JOB: &str = "Job";
const JOB_INVOICE: &str = "JobInvoice";
const OWNER_INVOICE: &str = "OwnerJobInvoice";
const DRIVER_INVOICE: &str = "DriverJobInvoice";
const DISPUTE: &str = "DisputeInvoice";
const LATE_FEE: &str = "LateFeeInvoice";
const MANUAL_PAYMENT: &str = "ManualPayment";

const BY_DEPTH: &str = "(body->>'curr_dispute')::int";
const BY_CREATED: &str = "(body->>'created_at')::timestamptz";

/// PostgreSQL-backed implementation of [`InvoiceStore`]
#[derive(Debug, Clone)]
pub struct PgInvoiceStore {
    records: RecordRepository,
}

impl PgInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            records: RecordRepository::new(pool),
        }
    }

    pub fn repository(&self) -> &RecordRepository {
        &self.records
    }
}

impl DomainPort for PgInvoiceStore {}

#[async_trait]
impl InvoiceStore for PgInvoiceStore {
    async fn get_job(&self, id: JobId) -> Result<Job, PortError> {
        Ok(self.records.get(JOB, *id.as_uuid()).await?)
    }

    async fn get_job_invoice(&self, id: JobInvoiceId) -> Result<JobInvoice, PortError> {
        Ok(self.records.get(JOB_INVOICE, *id.as_uuid()).await?)
    }

    async fn get_owner_invoice(&self, id: OwnerInvoiceId) -> Result<OwnerJobInvoice, PortError> {
        Ok(self.records.get(OWNER_INVOICE, *id.as_uuid()).await?)
    }

    async fn get_driver_invoice(&self, id: DriverInvoiceId) -> Result<DriverJobInvoice, PortError> {
        Ok(self.records.get(DRIVER_INVOICE, *id.as_uuid()).await?)
    }

    async fn get_dispute(&self, id: DisputeId) -> Result<DisputeInvoice, PortError> {
        Ok(self.records.get(DISPUTE, *id.as_uuid()).await?)
    }

    async fn get_late_fee(&self, id: LateFeeInvoiceId) -> Result<LateFeeInvoice, PortError> {
        Ok(self.records.get(LATE_FEE, *id.as_uuid()).await?)
    }

    async fn get_manual_payment(&self, id: ManualPaymentId) -> Result<ManualPayment, PortError> {
        Ok(self.records.get(MANUAL_PAYMENT, *id.as_uuid()).await?)
    }

    async fn job_invoices_for_job(&self, job_id: JobId) -> Result<Vec<JobInvoice>, PortError> {
        Ok(self
            .records
            .find_by_field(JOB_INVOICE, "job_id", &job_id.as_uuid().to_string(), BY_DEPTH)
            .await?)
    }

    async fn owner_invoices_for_job_invoice(
        &self,
        job_invoice_id: JobInvoiceId,
    ) -> Result<Vec<OwnerJobInvoice>, PortError> {
        Ok(self
            .records
            .find_by_field(
                OWNER_INVOICE,
                "job_invoice_id",
                &job_invoice_id.as_uuid().to_string(),
                "(body->>'invoice_number')::int",
            )
            .await?)
    }

    async fn driver_invoices_for_owner_invoice(
        &self,
        owner_invoice_id: OwnerInvoiceId,
    ) -> Result<Vec<DriverJobInvoice>, PortError> {
        Ok(self
            .records
            .find_by_field(
                DRIVER_INVOICE,
                "owner_invoice_id",
                &owner_invoice_id.as_uuid().to_string(),
                "(body->>'ticket_number')::int",
            )
            .await?)
    }

    async fn latest_job_invoice_by_order(&self, order_number: &str) -> Result<Option<JobInvoice>, PortError> {
        Ok(self
            .records
            .find_one_by_field(JOB_INVOICE, "order_number", order_number, "(body->>'curr_dispute')::int DESC")
            .await?)
    }

    async fn latest_owner_invoice_by_order(
        &self,
        owner_order_number: &str,
    ) -> Result<Option<OwnerJobInvoice>, PortError> {
        Ok(self
            .records
            .find_one_by_field(
                OWNER_INVOICE,
                "owner_order_number",
                owner_order_number,
                "(body->>'curr_dispute')::int DESC",
            )
            .await?)
    }

    async fn late_fees_for_job_invoice(&self, job_invoice_id: JobInvoiceId) -> Result<Vec<LateFeeInvoice>, PortError> {
        Ok(self
            .records
            .find_by_field(LATE_FEE, "job_invoice_id", &job_invoice_id.as_uuid().to_string(), BY_CREATED)
            .await?)
    }

    #[instrument(skip(self))]
    async fn overdue_job_invoices(&self, now: DateTime<Utc>) -> Result<Vec<JobInvoice>, PortError> {
        let query = sqlx::query_scalar(
            r#"
            SELECT body FROM invoicing_records
            WHERE kind = $1
              AND (body->>'is_paid')::boolean = false
              AND body->>'status' <> 'CANCELED'
              AND (body->>'due_date')::timestamptz < $2
            ORDER BY (body->>'due_date')::timestamptz
            "#,
        )
        .bind(JOB_INVOICE)
        .bind(now);
        Ok(self.records.fetch_bodies(query).await?)
    }

    async fn unpaid_job_invoices_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobInvoice>, PortError> {
        let query = sqlx::query_scalar(
            r#"
            SELECT body FROM invoicing_records
            WHERE kind = $1
              AND (body->>'is_paid')::boolean = false
              AND body->>'status' <> 'CANCELED'
              AND (body->>'due_date')::timestamptz >= $2
              AND (body->>'due_date')::timestamptz < $3
            ORDER BY (body->>'due_date')::timestamptz
            "#,
        )
        .bind(JOB_INVOICE)
        .bind(from)
        .bind(to);
        Ok(self.records.fetch_bodies(query).await?)
    }

    async fn owner_invoices_pending_acceptance(&self) -> Result<Vec<OwnerJobInvoice>, PortError> {
        let query = sqlx::query_scalar(
            r#"
            SELECT body FROM invoicing_records
            WHERE kind = $1
              AND (body->>'is_paid')::boolean = false
              AND NOT ((body->>'is_accepted_by_owner')::boolean
                       AND (body->>'is_accepted_by_contractor')::boolean)
            ORDER BY (body->>'created_at')::timestamptz
            "#,
        )
        .bind(OWNER_INVOICE);
        Ok(self.records.fetch_bodies(query).await?)
    }

    async fn owner_invoices_awaiting_payout(&self, now: DateTime<Utc>) -> Result<Vec<OwnerJobInvoice>, PortError> {
        let query = sqlx::query_scalar(
            r#"
            SELECT o.body FROM invoicing_records o
            JOIN invoicing_records j
              ON j.kind = $2 AND j.id = (o.body->>'job_invoice_id')::uuid
            WHERE o.kind = $1
              AND (o.body->>'is_paid')::boolean = false
              AND o.body->>'transfer_id' IS NULL
              AND (
                ((o.body->'cash_advance'->>'confirmed')::boolean
                  AND (o.body->'cash_advance'->>'accepted')::boolean)
                OR ((j.body->>'is_paid')::boolean
                  AND (o.body->>'due_date')::timestamptz <= $3)
              )
            ORDER BY (o.body->>'due_date')::timestamptz
            "#,
        )
        .bind(OWNER_INVOICE)
        .bind(JOB_INVOICE)
        .bind(now);
        Ok(self.records.fetch_bodies(query).await?)
    }

    async fn job_invoice_by_payment_intent(&self, intent_id: &str) -> Result<Option<JobInvoice>, PortError> {
        Ok(self
            .records
            .find_one_by_field(JOB_INVOICE, "payment_intent_id", intent_id, BY_DEPTH)
            .await?)
    }

    async fn job_invoice_by_external_invoice(&self, external_invoice_id: &str) -> Result<Option<JobInvoice>, PortError> {
        Ok(self
            .records
            .find_one_by_field(JOB_INVOICE, "external_invoice_id", external_invoice_id, BY_DEPTH)
            .await?)
    }

    async fn late_fee_by_charge(&self, charge_id: &str) -> Result<Option<LateFeeInvoice>, PortError> {
        Ok(self
            .records
            .find_one_by_field(LATE_FEE, "charge_id", charge_id, BY_CREATED)
            .await?)
    }

    async fn owner_invoice_by_transfer(&self, transfer_id: &str) -> Result<Option<OwnerJobInvoice>, PortError> {
        Ok(self
            .records
            .find_one_by_field(OWNER_INVOICE, "transfer_id", transfer_id, BY_CREATED)
            .await?)
    }

    async fn manual_payments_for(&self, target: PaymentTarget) -> Result<Vec<ManualPayment>, PortError> {
        let target = serde_json::to_value(target).map_err(DatabaseError::from)?;
        let query = sqlx::query_scalar(
            r#"
            SELECT body FROM invoicing_records
            WHERE kind = $1 AND body->'target' = $2
            ORDER BY (body->>'submitted_at')::timestamptz
            "#,
        )
        .bind(MANUAL_PAYMENT)
        .bind(target);
        Ok(self.records.fetch_bodies(query).await?)
    }

    async fn next_dispute_number(&self) -> Result<u64, PortError> {
        Ok(self.records.next_dispute_number().await?)
    }

    #[instrument(skip_all, fields(records = changes.len()))]
    async fn commit(&self, changes: ChangeSet) -> Result<(), PortError> {
        let (inserts, updates) = changes.into_parts();
        let inserts = inserts.iter().map(StoredRecord::encode).collect::<Result<Vec<_>, _>>()?;
        let updates = updates.iter().map(StoredRecord::encode).collect::<Result<Vec<_>, _>>()?;
        debug!(inserts = inserts.len(), updates = updates.len(), "Committing change set");
        Ok(self.records.apply(inserts, updates).await?)
    }
}

