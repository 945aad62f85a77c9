//! Invoice tree generation for finished jobs
//!
//! # Numbering
//!
//! - Owner invoices are numbered 1..N in scheduled-job order.
//! - `job_order_number` is `{job}-{invoice_number}`; `owner_order_number` uses
//!   the owner's short id instead of the number when the owner has one.
//! - Ticket numbers run 1..N across the whole job, never reset per owner.
//!
//! # Amounts
//!
//! Ticket amounts come from [`calculate_amount`]. An owner invoice's
//! `net_amount` is the sum of its tickets and its `amount` withholds the owner
//! fee unless contractor and owner are associated. The job invoice bills the
//! contractor the sum of owner net amounts.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use core_kernel::{
    CompanyId, DriverInvoiceId, JobId, JobInvoiceId, Money, OwnerInvoiceId,
};

use crate::error::InvoicingError;
use crate::invoice::{
    CashAdvance, DriverJobInvoice, EventsHistory, InvoiceEvent, InvoiceEventKind,
    InvoiceStatus, JobInvoice, OwnerJobInvoice,
};
use crate::job::{Assignment, Job};
use crate::notifications::{plan_admin_broadcast, NotificationDispatcher, Topic};
use crate::party::Company;
use crate::policy::BillingPolicy;
use crate::ports::{ChangeSet, InvoiceStore, PartyDirectory, PaymentGateway};
use crate::pricing::calculate_amount;

/// An owner invoice with its tickets
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerInvoiceTree {
    pub invoice: OwnerJobInvoice,
    pub tickets: Vec<DriverJobInvoice>,
}

/// A generated job invoice with everything under it
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceTree {
    pub job_invoice: JobInvoice,
    pub owners: Vec<OwnerInvoiceTree>,
}

impl InvoiceTree {
    pub fn tickets(&self) -> impl Iterator<Item = &DriverJobInvoice> {
        self.owners.iter().flat_map(|o| o.tickets.iter())
    }

    pub fn ticket_count(&self) -> usize {
        self.owners.iter().map(|o| o.tickets.len()).sum()
    }

    /// Stages every record of the tree as an insert
    pub fn stage(&self, changes: &mut ChangeSet) {
        changes.insert(self.job_invoice.clone());
        for owner in &self.owners {
            changes.insert(owner.invoice.clone());
            for ticket in &owner.tickets {
                changes.insert(ticket.clone());
            }
        }
    }

    fn summary(&self) -> serde_json::Value {
        let tons: rust_decimal::Decimal = self.tickets().map(|t| t.sum_tons).sum();
        let loads: rust_decimal::Decimal = self.tickets().map(|t| t.sum_load).sum();
        serde_json::json!({
            "orderNumber": self.job_invoice.order_number,
            "tickets": self.ticket_count(),
            "tons": tons,
            "loads": loads,
            "amount": self.job_invoice.amount,
        })
    }
}

/// Owner invoice amount after the owner fee, unless the parties are associated
pub(crate) fn owner_payable(net: Money, associated: bool, policy: &BillingPolicy) -> Money {
    if associated {
        net
    } else {
        policy.owner_fee.deduct_from(&net).round_to_currency()
    }
}

pub(crate) fn build_ticket(
    assignment: &Assignment,
    ticket_number: u32,
    owner_invoice: &OwnerJobInvoice,
    now: DateTime<Utc>,
) -> DriverJobInvoice {
    let hours = assignment.billable_hours();
    let amount = calculate_amount(assignment.price, assignment.commodity, assignment.quantities(), hours);
    let mut events_history = EventsHistory::new();
    events_history.push(InvoiceEvent::new(InvoiceEventKind::Created, now).with_amount(amount));

    DriverJobInvoice {
        id: DriverInvoiceId::new_v7(),
        owner_invoice_id: owner_invoice.id,
        job_invoice_id: owner_invoice.job_invoice_id,
        job_id: owner_invoice.job_id,
        assignment_id: assignment.id,
        driver_id: assignment.driver_id,
        ticket_number,
        amount,
        price: assignment.price,
        commodity: assignment.commodity,
        hours,
        sum_tons: assignment.tons,
        sum_load: assignment.load,
        is_accepted_by_owner: false,
        is_accepted_by_contractor: false,
        is_paid: false,
        paid_at: None,
        paid_with: None,
        time_entry: assignment.work_window(),
        loads: assignment.loads.clone(),
        dispute_invoice: None,
        previous_dispute_invoice: None,
        curr_dispute: owner_invoice.curr_dispute,
        created_at: now,
        events_history,
        version: 0,
    }
}

/// Builds the three-tier invoice tree for a finished job
///
/// Pure: nothing is persisted. Owner groups without a billable assignment
/// produce no owner invoice.
///
/// # Errors
///
/// - `NotFound` if an owner company is missing from `owners`
/// - `NothingToInvoice` if no assignment was ever clocked
pub fn build_invoice_tree(
    job: &Job,
    contractor: &Company,
    owners: &HashMap<CompanyId, Company>,
    policy: &BillingPolicy,
    now: DateTime<Utc>,
) -> Result<InvoiceTree, InvoicingError> {
    let currency = policy.currency;
    let job_invoice_id = JobInvoiceId::new_v7();
    let mut owner_trees = Vec::new();
    let mut next_ticket = 1u32;

    for scheduled in &job.scheduled {
        let billable: Vec<&Assignment> = scheduled.assignments.iter().filter(|a| a.is_billable()).collect();
        if billable.is_empty() {
            continue;
        }
        let owner = owners.get(&scheduled.owner_company_id).ok_or_else(|| InvoicingError::NotFound {
            entity: "Company".to_string(),
            id: scheduled.owner_company_id.to_string(),
        })?;

        let invoice_number = owner_trees.len() as u32 + 1;
        let associated = contractor.is_associated_with(owner);
        let mut invoice = OwnerJobInvoice {
            id: OwnerInvoiceId::new_v7(),
            job_invoice_id,
            job_id: job.id,
            owner_id: owner.id,
            invoice_number,
            job_order_number: format!("{}-{}", job.order_number, invoice_number),
            owner_order_number: owner.order_number(&job.order_number, invoice_number),
            amount: Money::zero(currency),
            net_amount: Money::zero(currency),
            is_associated_invoice: associated,
            is_paid: false,
            paid_at: None,
            is_accepted_by_owner: false,
            is_accepted_by_contractor: false,
            due_date: job.due_date + Duration::days(policy.owner_grace_days),
            created_at: now,
            curr_dispute: 0,
            cash_advance: CashAdvance::default(),
            transfer_id: None,
            events_history: EventsHistory::new(),
            version: 0,
        };

        let tickets: Vec<DriverJobInvoice> = billable
            .into_iter()
            .map(|assignment| {
                let ticket = build_ticket(assignment, next_ticket, &invoice, now);
                next_ticket += 1;
                ticket
            })
            .collect();

        let net = Money::try_sum(tickets.iter().map(|t| &t.amount), currency)?;
        invoice.net_amount = net;
        invoice.amount = owner_payable(net, associated, policy);
        invoice
            .events_history
            .push(InvoiceEvent::new(InvoiceEventKind::Created, now).with_amount(invoice.amount));

        owner_trees.push(OwnerInvoiceTree { invoice, tickets });
    }

    if owner_trees.is_empty() {
        return Err(InvoicingError::NothingToInvoice(job.id));
    }

    let amount = Money::try_sum(owner_trees.iter().map(|o| &o.invoice.net_amount), currency)?;
    let mut events_history = EventsHistory::new();
    events_history.push(InvoiceEvent::new(InvoiceEventKind::Created, now).with_amount(amount));

    let job_invoice = JobInvoice {
        id: job_invoice_id,
        job_id: job.id,
        contractor_id: contractor.id,
        order_number: job.order_number.clone(),
        contractor_order_number: contractor.order_number(&job.order_number, 1),
        amount,
        due_date: job.due_date,
        created_at: now,
        is_paid: false,
        paid_at: None,
        is_accepted: false,
        status: InvoiceStatus::Created,
        curr_dispute: 0,
        has_discount: None,
        events_history,
        payment_intent_id: None,
        customer_id: None,
        external_invoice_id: None,
        supersedes: None,
        version: 0,
    };

    Ok(InvoiceTree {
        job_invoice,
        owners: owner_trees,
    })
}

/// Result of the best-effort external invoice call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalInvoiceOutcome {
    Created(String),
    Failed { reason: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub job_invoice_id: JobInvoiceId,
    pub owner_invoice_ids: Vec<OwnerInvoiceId>,
    pub ticket_count: usize,
    pub external_invoice: ExternalInvoiceOutcome,
}

/// Service turning finished jobs into invoice trees
pub struct InvoiceGenerator {
    store: Arc<dyn InvoiceStore>,
    directory: Arc<dyn PartyDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    dispatcher: NotificationDispatcher,
    policy: BillingPolicy,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        directory: Arc<dyn PartyDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: NotificationDispatcher,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            gateway,
            dispatcher,
            policy,
        }
    }

    /// Generates and persists the invoice tree of a finished job
    ///
    /// The tree and the job's `invoiced_at` marker are committed as one
    /// change set, so two concurrent generations for the same job cannot both
    /// succeed. The external invoice is created afterwards; its failure is
    /// reported in the returned [`GenerationReport`] and never undoes the
    /// commit.
    ///
    /// # Errors
    ///
    /// - `JobAlreadyInvoiced` if the job already has a generated tree
    /// - `NothingToInvoice` if no assignment has time entries
    /// - `Conflict` if another generation committed first
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn generate(&self, job_id: JobId, now: DateTime<Utc>) -> Result<GenerationReport, InvoicingError> {
        let mut job = self.store.get_job(job_id).await?;
        if job.is_invoiced() {
            return Err(InvoicingError::JobAlreadyInvoiced(job_id));
        }

        let contractor = self.directory.company(job.contractor_id).await?;
        let mut owners = HashMap::new();
        for scheduled in &job.scheduled {
            if !owners.contains_key(&scheduled.owner_company_id) {
                let owner = self.directory.company(scheduled.owner_company_id).await?;
                owners.insert(owner.id, owner);
            }
        }

        let tree = build_invoice_tree(&job, &contractor, &owners, &self.policy, now)?;

        let mut changes = ChangeSet::new();
        tree.stage(&mut changes);
        job.invoiced_at = Some(now);
        changes.update(job);
        self.store.commit(changes).await?;

        info!(
            job_invoice_id = %tree.job_invoice.id,
            owner_invoices = tree.owners.len(),
            tickets = tree.ticket_count(),
            amount = %tree.job_invoice.amount,
            "Invoice tree generated"
        );

        let external_invoice = match self.create_external_invoice(tree.job_invoice.id).await {
            Ok(id) => ExternalInvoiceOutcome::Created(id),
            Err(e) => {
                warn!(job_invoice_id = %tree.job_invoice.id, error = %e, "External invoice creation failed");
                ExternalInvoiceOutcome::Failed {
                    retryable: e.is_retryable(),
                    reason: e.to_string(),
                }
            }
        };

        match self.directory.admins().await {
            Ok(admins) => {
                self.dispatcher
                    .dispatch(plan_admin_broadcast(&admins, Topic::InvoiceGenerated, tree.summary()))
                    .await;
            }
            Err(e) => warn!(job_invoice_id = %tree.job_invoice.id, error = %e, "Admin lookup failed, generation not announced"),
        }

        Ok(GenerationReport {
            job_invoice_id: tree.job_invoice.id,
            owner_invoice_ids: tree.owners.iter().map(|o| o.invoice.id).collect(),
            ticket_count: tree.ticket_count(),
            external_invoice,
        })
    }

    /// Repeats the external invoice call for a job invoice that lacks one
    ///
    /// Returns the existing id when the invoice already has one.
    #[instrument(skip_all, fields(job_invoice_id = %job_invoice_id))]
    pub async fn retry_external_invoice(&self, job_invoice_id: JobInvoiceId) -> Result<String, InvoicingError> {
        self.create_external_invoice(job_invoice_id).await
    }

    async fn create_external_invoice(&self, job_invoice_id: JobInvoiceId) -> Result<String, InvoicingError> {
        let mut invoice = self.store.get_job_invoice(job_invoice_id).await?;
        if let Some(existing) = &invoice.external_invoice_id {
            return Ok(existing.clone());
        }

        let external_id = self.gateway.create_invoice(&invoice).await?;
        invoice.external_invoice_id = Some(external_id.clone());
        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        Ok(external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use crate::ports::GatewayError;
    use rust_decimal_macros::dec;

    #[test]
    fn test_simple_by_hour_job_amounts() {
        let (job, contractor, owners) = fixtures::simple_hourly_job();
        let tree = build_invoice_tree(&job, &contractor, &owners, &BillingPolicy::default(), fixtures::now()).unwrap();

        let ticket = tree.tickets().next().unwrap();
        assert_eq!(ticket.amount.amount(), dec!(200.00));
        assert_eq!(ticket.ticket_number, 1);
        assert_eq!(tree.owners[0].invoice.net_amount.amount(), dec!(200.00));
        assert_eq!(tree.owners[0].invoice.amount.amount(), dec!(188.00));
        assert_eq!(tree.job_invoice.amount.amount(), dec!(200.00));
    }

    #[test]
    fn test_associated_owner_is_not_charged_the_fee() {
        let (job, mut contractor, mut owners) = fixtures::simple_hourly_job();
        let owner = owners.values_mut().next().unwrap();
        contractor.associated_user_id = Some(owner.user_id);
        owner.associated_user_id = Some(contractor.user_id);

        let tree = build_invoice_tree(&job, &contractor, &owners, &BillingPolicy::default(), fixtures::now()).unwrap();
        let invoice = &tree.owners[0].invoice;
        assert!(invoice.is_associated_invoice);
        assert_eq!(invoice.amount, invoice.net_amount);
    }

    #[test]
    fn test_ticket_numbers_run_across_owners_and_skip_unclocked() {
        let (job, contractor, owners) = fixtures::two_owner_job();
        let tree = build_invoice_tree(&job, &contractor, &owners, &BillingPolicy::default(), fixtures::now()).unwrap();

        let numbers: Vec<u32> = tree.tickets().map(|t| t.ticket_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(tree.owners.len(), 2);
        assert_eq!(tree.owners[1].invoice.invoice_number, 2);
        assert_eq!(tree.owners[1].invoice.job_order_number, format!("{}-2", job.order_number));
    }

    #[test]
    fn test_owner_due_date_adds_grace_days() {
        let (job, contractor, owners) = fixtures::simple_hourly_job();
        let tree = build_invoice_tree(&job, &contractor, &owners, &BillingPolicy::default(), fixtures::now()).unwrap();
        assert_eq!(tree.job_invoice.due_date, job.due_date);
        assert_eq!(tree.owners[0].invoice.due_date, job.due_date + Duration::days(5));
    }

    #[test]
    fn test_job_without_time_entries_has_nothing_to_invoice() {
        let (mut job, contractor, owners) = fixtures::simple_hourly_job();
        for scheduled in &mut job.scheduled {
            for assignment in &mut scheduled.assignments {
                assignment.time_entries.clear();
            }
        }
        let result = build_invoice_tree(&job, &contractor, &owners, &BillingPolicy::default(), fixtures::now());
        assert!(matches!(result, Err(InvoicingError::NothingToInvoice(_))));
    }

    #[tokio::test]
    async fn test_generate_persists_tree_and_rejects_second_run() {
        let harness = Harness::with_simple_hourly_job().await;
        let generator = harness.generator();

        let report = generator.generate(harness.job_id, fixtures::now()).await.unwrap();
        assert!(matches!(report.external_invoice, ExternalInvoiceOutcome::Created(_)));

        let stored = harness.store.get_job_invoice(report.job_invoice_id).await.unwrap();
        assert!(stored.external_invoice_id.is_some());

        let again = generator.generate(harness.job_id, fixtures::now()).await;
        assert!(matches!(again, Err(InvoicingError::JobAlreadyInvoiced(_))));
    }

    #[tokio::test]
    async fn test_external_invoice_failure_keeps_tree_and_can_be_retried() {
        let harness = Harness::with_simple_hourly_job().await;
        harness.payments.fail_next(GatewayError::Unavailable("timeout".into())).await;
        let generator = harness.generator();

        let report = generator.generate(harness.job_id, fixtures::now()).await.unwrap();
        assert!(matches!(report.external_invoice, ExternalInvoiceOutcome::Failed { retryable: true, .. }));

        let stored = harness.store.get_job_invoice(report.job_invoice_id).await.unwrap();
        assert!(stored.external_invoice_id.is_none());

        let external_id = generator.retry_external_invoice(report.job_invoice_id).await.unwrap();
        let stored = harness.store.get_job_invoice(report.job_invoice_id).await.unwrap();
        assert_eq!(stored.external_invoice_id, Some(external_id));
    }

    #[tokio::test]
    async fn test_generation_survives_admin_lookup_failure() {
        let harness = Harness::with_simple_hourly_job().await;
        harness.directory.fail_admin_lookups();

        let report = harness.generator().generate(harness.job_id, fixtures::now()).await.unwrap();
        assert!(matches!(report.external_invoice, ExternalInvoiceOutcome::Created(_)));
        assert!(harness.store.get_job_invoice(report.job_invoice_id).await.is_ok());
        assert!(harness
            .notifications
            .delivered_for(crate::notifications::Topic::InvoiceGenerated)
            .await
            .is_empty());
    }
}
