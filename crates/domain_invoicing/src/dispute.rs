//! Ticket disputes and the superseding invoice chain
//!
//! A dispute is opened against one driver ticket. Resolving it never edits
//! the disputed rows: it writes a fresh job invoice, owner invoice and ticket
//! one dispute level deeper (`curr_dispute + 1`) and links them back through
//! `supersedes` and `previous_dispute_invoice`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use core_kernel::{
    shift_days, whole_days_elapsed, DisputeId, DriverInvoiceId, JobInvoiceId, Money,
    OwnerInvoiceId, UserId,
};

use crate::error::InvoicingError;
use crate::generator::owner_payable;
use crate::invoice::Payable;
use crate::invoice::{
    Actor, CashAdvance, DriverJobInvoice, EventsHistory, InvoiceEvent, InvoiceEventKind,
    InvoiceStatus, JobInvoice, OwnerJobInvoice,
};
use crate::job::{LoadEvent, LoadEventKind, TimeEntry};
use crate::ledger::TicketLedger;
use crate::notifications::{plan_admin_broadcast, plan_company, Channel, NotificationDispatcher, Topic};
use crate::party::Company;
use crate::policy::BillingPolicy;
use crate::ports::{ChangeSet, InvoiceStore, PartyDirectory};
use crate::pricing::{calculate_amount, Quantities};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Pending,
    Started,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequesterRole {
    Owner,
    Contractor,
    Driver,
    Admin,
}

/// A load event frozen at the moment a dispute was opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeLoad {
    pub dispute_id: DisputeId,
    pub kind: LoadEventKind,
    pub tons: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub ticket_ref: Option<String>,
    pub evidence: Option<String>,
}

impl DisputeLoad {
    /// Copies the listed fields only; the ledger id is dropped
    pub fn snapshot(dispute_id: DisputeId, event: &LoadEvent) -> Self {
        Self {
            dispute_id,
            kind: event.kind,
            tons: event.tons,
            occurred_at: event.occurred_at,
            ticket_ref: event.ticket_ref.clone(),
            evidence: event.evidence.clone(),
        }
    }
}

/// A dispute against one driver ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeInvoice {
    pub id: DisputeId,
    /// Global, monotonic
    pub dispute_number: u64,
    pub status: DisputeStatus,
    pub request_by: UserId,
    pub request_by_role: RequesterRole,
    pub reasons: Vec<String>,
    pub requirements: Option<String>,
    pub result: Option<String>,
    pub resolution: Option<String>,
    pub evidences: Vec<String>,
    pub result_resume: Vec<String>,
    pub dispute_loads: Vec<DisputeLoad>,
    pub driver_job_invoice: Option<DriverInvoiceId>,
    /// The disputed ticket
    pub previous_driver_invoice: Option<DriverInvoiceId>,
    /// The ticket written by the resolution
    pub result_driver_job_invoice: Option<DriverInvoiceId>,
    pub opened_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub solved_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl DisputeInvoice {
    pub fn is_done(&self) -> bool {
        self.status == DisputeStatus::Done
    }

    /// The ticket a resolution applies to
    pub fn disputed_ticket(&self) -> Option<DriverInvoiceId> {
        self.driver_job_invoice.or(self.previous_driver_invoice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDisputeRequest {
    pub driver_invoice_id: DriverInvoiceId,
    pub requested_by: UserId,
    pub role: RequesterRole,
    pub reasons: Vec<String>,
    pub requirements: Option<String>,
}

/// Figures agreed during review; `None` keeps the ticket's value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustedFigures {
    pub tons: Option<Decimal>,
    pub load: Option<Decimal>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl AdjustedFigures {
    fn overrides_window(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "figures", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeOutcome {
    /// The ticket stands as billed
    Upheld,
    Adjusted(AdjustedFigures),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub result: String,
    pub resolution: String,
    pub evidences: Vec<String>,
    pub resume: Vec<String>,
    pub outcome: DisputeOutcome,
}

/// Billing figures of the ticket a resolution writes
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFigures {
    pub tons: Decimal,
    pub load: Decimal,
    pub hours: Decimal,
    pub time_entry: Option<TimeEntry>,
    pub amount: Money,
}

/// Applies a dispute outcome to the disputed ticket
///
/// Hours are recomputed from the agreed window plus travel time only when the
/// window itself was overridden.
pub fn resolve_figures(
    ticket: &DriverJobInvoice,
    outcome: &DisputeOutcome,
    travel_hours: Decimal,
) -> Result<ResolvedFigures, InvoicingError> {
    let rebilled = |entry: &TimeEntry| TimeEntry::new(entry.start, entry.end);

    match outcome {
        DisputeOutcome::Upheld => Ok(ResolvedFigures {
            tons: ticket.sum_tons,
            load: ticket.sum_load,
            hours: ticket.hours,
            time_entry: ticket.time_entry.as_ref().map(rebilled),
            amount: ticket.amount,
        }),
        DisputeOutcome::Adjusted(figures) => {
            let tons = figures.tons.unwrap_or(ticket.sum_tons);
            let load = figures.load.unwrap_or(ticket.sum_load);

            let (hours, time_entry) = if figures.overrides_window() {
                let billed = ticket.time_entry.as_ref();
                let start = figures.start.or(billed.map(|e| e.start));
                let end = figures.end.or(billed.map(|e| e.end));
                let (start, end) = match (start, end) {
                    (Some(s), Some(e)) => (s, e),
                    _ => {
                        return Err(InvoicingError::invalid_state(
                            "ticket has no billed window to adjust; both start and end are required",
                        ))
                    }
                };
                if end < start {
                    return Err(InvoicingError::invalid_state("adjusted window ends before it starts"));
                }
                let window = TimeEntry::new(start, end);
                (window.hours() + travel_hours, Some(window))
            } else {
                (ticket.hours, ticket.time_entry.as_ref().map(rebilled))
            };

            let amount = calculate_amount(ticket.price, ticket.commodity, Quantities::new(tons, load), hours);
            Ok(ResolvedFigures {
                tons,
                load,
                hours,
                time_entry,
                amount,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionReport {
    pub dispute_id: DisputeId,
    pub job_invoice_id: JobInvoiceId,
    pub owner_invoice_id: OwnerInvoiceId,
    pub driver_invoice_id: DriverInvoiceId,
    pub curr_dispute: u32,
}

/// Opens, reviews and resolves ticket disputes
pub struct DisputeResolutionEngine {
    store: Arc<dyn InvoiceStore>,
    directory: Arc<dyn PartyDirectory>,
    dispatcher: NotificationDispatcher,
    policy: BillingPolicy,
}

impl DisputeResolutionEngine {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        directory: Arc<dyn PartyDirectory>,
        dispatcher: NotificationDispatcher,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            dispatcher,
            policy,
        }
    }

    /// Opens a dispute against a driver ticket
    ///
    /// The dispute row, the ticket's `dispute_invoice` link and the
    /// `START_DISPUTE` events on the owner and job invoices are one change
    /// set. Of two concurrent opens on the same ticket only one commits; the
    /// other gets `DisputeAlreadyOpen`.
    ///
    /// # Errors
    ///
    /// - `DisputeAlreadyOpen` if the ticket already links a dispute
    /// - `InvoiceAlreadyPaid` if the job or owner invoice is paid
    /// - `InvalidState` if the ticket is paid, a checkout or manual payment
    ///   of the job invoice is in flight, or the owner payout was created
    #[instrument(skip_all, fields(driver_invoice_id = %request.driver_invoice_id))]
    pub async fn create_dispute_driver(
        &self,
        request: OpenDisputeRequest,
        now: DateTime<Utc>,
    ) -> Result<DisputeInvoice, InvoicingError> {
        let mut ticket = self.store.get_driver_invoice(request.driver_invoice_id).await?;
        if ticket.dispute_invoice.is_some() {
            return Err(InvoicingError::DisputeAlreadyOpen(ticket.id));
        }
        if ticket.is_paid {
            return Err(InvoicingError::invalid_state(format!(
                "driver invoice {} is already paid",
                ticket.id
            )));
        }

        let mut owner = self.store.get_owner_invoice(ticket.owner_invoice_id).await?;
        let mut job_invoice = self.store.get_job_invoice(ticket.job_invoice_id).await?;
        if job_invoice.is_paid {
            return Err(InvoicingError::InvoiceAlreadyPaid(job_invoice.display_order_number()));
        }
        if matches!(job_invoice.status, InvoiceStatus::Pending | InvoiceStatus::Processing) {
            return Err(InvoicingError::invalid_state(format!(
                "{} has a payment in progress",
                job_invoice.display_order_number()
            )));
        }
        if owner.is_paid {
            return Err(InvoicingError::InvoiceAlreadyPaid(owner.display_order_number()));
        }
        if owner.transfer_id.is_some() {
            return Err(InvoicingError::invalid_state(format!(
                "{} was already paid out to the owner",
                owner.display_order_number()
            )));
        }

        let job = self.store.get_job(ticket.job_id).await?;
        let ledger: &[LoadEvent] = match job.assignment(ticket.assignment_id) {
            Some(assignment) => &assignment.loads,
            None => &ticket.loads,
        };

        let id = DisputeId::new_v7();
        let dispute = DisputeInvoice {
            id,
            dispute_number: self.store.next_dispute_number().await?,
            status: DisputeStatus::Pending,
            request_by: request.requested_by,
            request_by_role: request.role,
            reasons: request.reasons,
            requirements: request.requirements,
            result: None,
            resolution: None,
            evidences: Vec::new(),
            result_resume: Vec::new(),
            dispute_loads: ledger.iter().map(|e| DisputeLoad::snapshot(id, e)).collect(),
            driver_job_invoice: None,
            previous_driver_invoice: Some(ticket.id),
            result_driver_job_invoice: None,
            opened_at: now,
            started_at: None,
            solved_at: None,
            version: 0,
        };

        let actor = Actor::User(request.requested_by);
        let started = || {
            InvoiceEvent::new(InvoiceEventKind::StartDispute, now)
                .by(&actor)
                .with_data(serde_json::json!({ "disputeNumber": dispute.dispute_number }))
        };

        owner.events_history.push(started());
        job_invoice.events_history.push(started());
        ticket.dispute_invoice = Some(id);

        let notify_data = serde_json::json!({
            "disputeNumber": dispute.dispute_number,
            "ticketNumber": ticket.ticket_number,
            "orderNumber": owner.display_order_number(),
        });

        let mut changes = ChangeSet::new();
        changes
            .insert(dispute.clone())
            .update(ticket.clone())
            .update(owner)
            .update(job_invoice);

        if let Err(e) = self.store.commit(changes).await {
            if e.is_conflict() {
                let current = self.store.get_driver_invoice(ticket.id).await?;
                if current.dispute_invoice.is_some() {
                    return Err(InvoicingError::DisputeAlreadyOpen(ticket.id));
                }
            }
            return Err(e.into());
        }

        info!(dispute_id = %id, dispute_number = dispute.dispute_number, "Dispute opened");

        match self.directory.admins().await {
            Ok(admins) => {
                self.dispatcher
                    .dispatch(plan_admin_broadcast(&admins, Topic::DisputeOpened, notify_data))
                    .await;
            }
            Err(e) => warn!(dispute_id = %id, error = %e, "Admin lookup failed, dispute opened without notice"),
        }

        Ok(self.store.get_dispute(id).await?)
    }

    /// Moves a pending dispute into review; repeated calls are no-ops
    #[instrument(skip_all, fields(dispute_id = %dispute_id))]
    pub async fn begin_review(&self, dispute_id: DisputeId, now: DateTime<Utc>) -> Result<DisputeInvoice, InvoicingError> {
        let mut dispute = self.store.get_dispute(dispute_id).await?;
        match dispute.status {
            DisputeStatus::Done => return Err(InvoicingError::DisputeAlreadyResolved(dispute_id)),
            DisputeStatus::Started => return Ok(dispute),
            DisputeStatus::Pending => {}
        }

        dispute.status = DisputeStatus::Started;
        dispute.started_at = Some(now);
        let mut changes = ChangeSet::new();
        changes.update(dispute);
        self.store.commit(changes).await?;
        Ok(self.store.get_dispute(dispute_id).await?)
    }

    /// Resolves a dispute and writes the superseding invoice chain
    ///
    /// # Errors
    ///
    /// - `DisputeAlreadyResolved` if the dispute is DONE
    /// - `InvalidState` if the outcome cannot be applied to the ticket
    /// - `Conflict` if any touched record changed since it was read
    #[instrument(skip_all, fields(dispute_id = %dispute_id))]
    pub async fn mark_dispute_solved(
        &self,
        dispute_id: DisputeId,
        resolution: DisputeResolution,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<ResolutionReport, InvoicingError> {
        let mut dispute = self.store.get_dispute(dispute_id).await?;
        if dispute.is_done() {
            return Err(InvoicingError::DisputeAlreadyResolved(dispute_id));
        }
        let ticket_id = dispute
            .disputed_ticket()
            .ok_or_else(|| InvoicingError::invalid_state(format!("dispute {} has no ticket", dispute_id)))?;

        let ticket = self.store.get_driver_invoice(ticket_id).await?;
        let mut owner_invoice = self.store.get_owner_invoice(ticket.owner_invoice_id).await?;
        let mut job_invoice = self.store.get_job_invoice(ticket.job_invoice_id).await?;
        let mut job = self.store.get_job(ticket.job_id).await?;

        let travel_hours = job
            .assignment(ticket.assignment_id)
            .map(|a| a.travel_hours())
            .unwrap_or(Decimal::ZERO);
        let figures = resolve_figures(&ticket, &resolution.outcome, travel_hours)?;

        let ended = || {
            InvoiceEvent::new(InvoiceEventKind::EndDispute, now)
                .by(&actor)
                .with_data(serde_json::json!({ "disputeNumber": dispute.dispute_number }))
        };
        owner_invoice.events_history.push(ended());
        job_invoice.events_history.push(ended());

        let chain = self
            .create_invoice_for_dispute(&job_invoice, &owner_invoice, &ticket, &figures, &dispute, now)
            .await?;

        if let Some(assignment) = job.assignment_mut(ticket.assignment_id) {
            assignment.tons = figures.tons;
            assignment.load = figures.load;
            if let (DisputeOutcome::Adjusted(f), Some(window)) = (&resolution.outcome, &figures.time_entry) {
                if f.overrides_window() {
                    assignment.time_entries = vec![window.clone()];
                }
            }
        }

        dispute.status = DisputeStatus::Done;
        dispute.result = Some(resolution.result);
        dispute.resolution = Some(resolution.resolution);
        dispute.evidences = resolution.evidences;
        dispute.result_resume = resolution.resume;
        dispute.driver_job_invoice = Some(chain.ticket.id);
        dispute.result_driver_job_invoice = Some(chain.ticket.id);
        dispute.solved_at = Some(now);

        // Nothing billable left under the prior job invoice once this ticket is replaced
        let remaining = TicketLedger::for_job_invoice(self.store.as_ref(), job_invoice.id)
            .await?
            .with_dispute(dispute.clone())
            .billable_total(job_invoice.amount.currency())?;
        if remaining.is_zero() && job_invoice.status.can_transition_to(InvoiceStatus::Canceled) {
            job_invoice.status = InvoiceStatus::Canceled;
            job_invoice.events_history.push(
                InvoiceEvent::new(InvoiceEventKind::Canceled, now)
                    .by(&actor)
                    .with_data(serde_json::json!({ "supersededBy": chain.job_invoice.id })),
            );
        }

        let report = ResolutionReport {
            dispute_id,
            job_invoice_id: chain.job_invoice.id,
            owner_invoice_id: chain.owner_invoice.id,
            driver_invoice_id: chain.ticket.id,
            curr_dispute: chain.owner_invoice.curr_dispute,
        };

        let notify_data = serde_json::json!({
            "disputeNumber": dispute.dispute_number,
            "orderNumber": chain.owner_invoice.display_order_number(),
            "amount": chain.ticket.amount,
        });
        let mut changes = ChangeSet::new();
        changes
            .insert(chain.job_invoice.clone())
            .insert(chain.owner_invoice.clone())
            .insert(chain.ticket.clone())
            .update(owner_invoice)
            .update(job_invoice)
            .update(job)
            .update(dispute);
        self.store.commit(changes).await?;

        info!(
            job_invoice_id = %report.job_invoice_id,
            curr_dispute = report.curr_dispute,
            "Dispute resolved"
        );

        let mut plan = Vec::new();
        for company in [&chain.owner, &chain.contractor] {
            plan.extend(plan_company(
                company,
                &[Channel::Push, Channel::Email],
                Topic::DisputeResolved,
                notify_data.clone(),
            ));
        }
        self.dispatcher.dispatch(plan).await;

        Ok(report)
    }

    /// Builds the job invoice, owner invoice and ticket of the next dispute level
    async fn create_invoice_for_dispute(
        &self,
        job_invoice: &JobInvoice,
        owner_invoice: &OwnerJobInvoice,
        ticket: &DriverJobInvoice,
        figures: &ResolvedFigures,
        dispute: &DisputeInvoice,
        now: DateTime<Utc>,
    ) -> Result<DisputeChain, InvoicingError> {
        let job_depth = self
            .store
            .latest_job_invoice_by_order(&job_invoice.order_number)
            .await?
            .map_or(job_invoice.curr_dispute, |latest| latest.curr_dispute.max(job_invoice.curr_dispute))
            + 1;
        let owner_depth = self
            .store
            .latest_owner_invoice_by_order(&owner_invoice.owner_order_number)
            .await?
            .map_or(owner_invoice.curr_dispute, |latest| latest.curr_dispute.max(owner_invoice.curr_dispute))
            + 1;

        let contractor = self.directory.company(job_invoice.contractor_id).await?;
        let owner = self.directory.company(owner_invoice.owner_id).await?;
        let associated = contractor.is_associated_with(&owner);
        let elapsed = whole_days_elapsed(dispute.opened_at, now);

        let created = |amount| {
            let mut history = EventsHistory::new();
            history.push(
                InvoiceEvent::new(InvoiceEventKind::Created, now)
                    .with_amount(amount)
                    .with_data(serde_json::json!({ "disputeNumber": dispute.dispute_number })),
            );
            history
        };

        let amount = figures.amount;
        let new_job_invoice = JobInvoice {
            id: JobInvoiceId::new_v7(),
            job_id: job_invoice.job_id,
            contractor_id: job_invoice.contractor_id,
            order_number: job_invoice.order_number.clone(),
            contractor_order_number: job_invoice.contractor_order_number.clone(),
            amount,
            due_date: shift_days(job_invoice.due_date, elapsed),
            created_at: now,
            is_paid: false,
            paid_at: None,
            is_accepted: false,
            status: InvoiceStatus::Created,
            curr_dispute: job_depth,
            has_discount: None,
            events_history: created(amount),
            payment_intent_id: None,
            customer_id: None,
            external_invoice_id: None,
            supersedes: Some(job_invoice.id),
            version: 0,
        };

        let payable = owner_payable(amount, associated, &self.policy);
        let new_owner_invoice = OwnerJobInvoice {
            id: OwnerInvoiceId::new_v7(),
            job_invoice_id: new_job_invoice.id,
            job_id: owner_invoice.job_id,
            owner_id: owner_invoice.owner_id,
            invoice_number: owner_invoice.invoice_number,
            job_order_number: owner_invoice.job_order_number.clone(),
            owner_order_number: owner_invoice.owner_order_number.clone(),
            amount: payable,
            net_amount: amount,
            is_associated_invoice: associated,
            is_paid: false,
            paid_at: None,
            is_accepted_by_owner: false,
            is_accepted_by_contractor: false,
            due_date: shift_days(owner_invoice.due_date, elapsed),
            created_at: now,
            curr_dispute: owner_depth,
            cash_advance: CashAdvance::default(),
            transfer_id: None,
            events_history: created(payable),
            version: 0,
        };

        let new_ticket = DriverJobInvoice {
            id: DriverInvoiceId::new_v7(),
            owner_invoice_id: new_owner_invoice.id,
            job_invoice_id: new_job_invoice.id,
            amount,
            hours: figures.hours,
            sum_tons: figures.tons,
            sum_load: figures.load,
            is_accepted_by_owner: false,
            is_accepted_by_contractor: false,
            is_paid: false,
            paid_at: None,
            paid_with: None,
            time_entry: figures.time_entry.clone(),
            dispute_invoice: None,
            previous_dispute_invoice: Some(dispute.id),
            curr_dispute: owner_depth,
            created_at: now,
            events_history: created(amount),
            version: 0,
            ..ticket.clone()
        };

        Ok(DisputeChain {
            job_invoice: new_job_invoice,
            owner_invoice: new_owner_invoice,
            ticket: new_ticket,
            contractor,
            owner,
        })
    }
}

/// The next dispute level and the two companies it is billed between
struct DisputeChain {
    job_invoice: JobInvoice,
    owner_invoice: OwnerJobInvoice,
    ticket: DriverJobInvoice,
    contractor: Company,
    owner: Company,
}
