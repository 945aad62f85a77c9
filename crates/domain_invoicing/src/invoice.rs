//! The three invoice tiers
//!
//! A finished job produces one [`JobInvoice`] billed to the contractor, one
//! [`OwnerJobInvoice`] per participating owner company and one
//! [`DriverJobInvoice`] ("ticket") per billable assignment. Each tier keeps an
//! append-only [`EventsHistory`] and a `version` used for compare-and-swap
//! writes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use core_kernel::{
    AssignmentId, CompanyId, DisputeId, DriverInvoiceId, JobId, JobInvoiceId, Money,
    OwnerInvoiceId, UserId,
};

use crate::error::InvoicingError;
use crate::job::{LoadEvent, TimeEntry};
use crate::pricing::CommodityKind;

/// Payment status shared by job invoices and late-fee invoices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Created,
    /// A manual payment claim awaits admin review
    Pending,
    /// The payment rail accepted the payment but has not settled it
    Processing,
    Paid,
    Canceled,
    /// The last manual payment claim was rejected
    Rejected,
}

impl InvoiceStatus {
    /// Checks if a transition to the target status is valid
    pub fn can_transition_to(&self, target: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, target),
            (Created, Pending | Processing | Paid | Canceled)
                | (Pending, Paid | Rejected)
                | (Processing, Paid | Rejected)
                | (Rejected, Pending | Processing | Paid)
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Canceled)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceStatus::Created => "CREATED",
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Processing => "PROCESSING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Canceled => "CANCELED",
            InvoiceStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceEventKind {
    Created,
    Accepted,
    AutoAccepted,
    StartDispute,
    EndDispute,
    Paid,
    PaymentPending,
    PaymentProcessing,
    PaymentRejected,
    LateFeeCharged,
    DueReminder,
    CashAdvanceRequested,
    CashAdvanceConfirmed,
    CashAdvanceRejected,
    DiscountApplied,
    DiscountRemoved,
    TransferCreated,
    /// Every ticket under the invoice was replaced by a dispute resolution
    Canceled,
}

/// One entry of an invoice's audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceEvent {
    #[serde(rename = "type")]
    pub kind: InvoiceEventKind,
    pub amount: Option<Money>,
    pub by: Option<String>,
    pub date: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl InvoiceEvent {
    pub fn new(kind: InvoiceEventKind, date: DateTime<Utc>) -> Self {
        Self {
            kind,
            amount: None,
            by: None,
            date,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn by(mut self, actor: &Actor) -> Self {
        self.by = Some(actor.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Append-only event log
///
/// Only `push` mutates the log; entries are never removed or edited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventsHistory(Vec<InvoiceEvent>);

impl EventsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: InvoiceEvent) {
        self.0.push(event);
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvoiceEvent> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count_of(&self, kind: InvoiceEventKind) -> usize {
        self.0.iter().filter(|e| e.kind == kind).count()
    }

    pub fn last(&self) -> Option<&InvoiceEvent> {
        self.0.last()
    }
}

/// Who performed an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    User(UserId),
    /// Scheduled sweeps and payment-rail callbacks
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "{}", id),
            Actor::System => f.write_str("system"),
        }
    }
}

/// Which side of a ticket is accepting it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcceptingParty {
    Owner,
    Contractor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Bank,
    ExternalInvoice,
    Transfer,
    Manual,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Bank => "bank",
            PaymentMethod::ExternalInvoice => "external_invoice",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Manual => "manual",
            PaymentMethod::Cash => "cash",
        }
    }
}

/// Common payment-state surface of job and late-fee invoices
pub trait Payable: Send + Sync {
    fn status(&self) -> InvoiceStatus;
    fn set_status(&mut self, status: InvoiceStatus);
    fn is_paid(&self) -> bool;
    fn set_paid(&mut self, at: DateTime<Utc>);
    fn payable_amount(&self) -> Money;
    fn history_mut(&mut self) -> &mut EventsHistory;
    fn display_order_number(&self) -> String;

    /// Marks the invoice paid; returns false when it already was
    ///
    /// # Errors
    ///
    /// `InvalidState` when the current status cannot move to `PAID`, e.g. a
    /// canceled invoice receiving a late payment callback.
    fn mark_paid(&mut self, method: PaymentMethod, actor: &Actor, at: DateTime<Utc>) -> Result<bool, InvoicingError> {
        if self.is_paid() {
            return Ok(false);
        }
        if !self.status().can_transition_to(InvoiceStatus::Paid) {
            return Err(InvoicingError::invalid_state(format!(
                "{} is {} and cannot be paid",
                self.display_order_number(),
                self.status()
            )));
        }
        let amount = self.payable_amount();
        self.set_paid(at);
        self.set_status(InvoiceStatus::Paid);
        self.history_mut().push(
            InvoiceEvent::new(InvoiceEventKind::Paid, at)
                .with_amount(amount)
                .by(actor)
                .with_data(serde_json::json!({ "method": method.as_str() })),
        );
        Ok(true)
    }
}

/// `{order}` at depth 0, `{order}-D{n}` afterwards
pub fn dispute_order_number(order: &str, curr_dispute: u32) -> String {
    if curr_dispute == 0 {
        order.to_string()
    } else {
        format!("{}-D{}", order, curr_dispute)
    }
}

/// Invoice billed to the contractor for a whole job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInvoice {
    pub id: JobInvoiceId,
    pub job_id: JobId,
    pub contractor_id: CompanyId,
    /// Base order number shared by every invoice in a dispute chain
    pub order_number: String,
    pub contractor_order_number: String,
    /// Pre-fee total of all owner invoices
    pub amount: Money,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_accepted: bool,
    pub status: InvoiceStatus,
    pub curr_dispute: u32,
    /// Payable override; toggled, never stacked
    pub has_discount: Option<Money>,
    pub events_history: EventsHistory,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub external_invoice_id: Option<String>,
    /// The invoice a dispute result replaced
    pub supersedes: Option<JobInvoiceId>,
    pub version: u64,
}

impl JobInvoice {
    pub fn is_open(&self) -> bool {
        !self.is_paid && self.status != InvoiceStatus::Canceled
    }
}

impl Payable for JobInvoice {
    fn status(&self) -> InvoiceStatus {
        self.status
    }

    fn set_status(&mut self, status: InvoiceStatus) {
        self.status = status;
    }

    fn is_paid(&self) -> bool {
        self.is_paid
    }

    fn set_paid(&mut self, at: DateTime<Utc>) {
        self.is_paid = true;
        self.paid_at = Some(at);
    }

    fn payable_amount(&self) -> Money {
        self.has_discount.unwrap_or(self.amount)
    }

    fn history_mut(&mut self) -> &mut EventsHistory {
        &mut self.events_history
    }

    fn display_order_number(&self) -> String {
        dispute_order_number(&self.order_number, self.curr_dispute)
    }
}

/// Cash-advance flags of an owner invoice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashAdvance {
    pub requested: bool,
    pub confirmed: bool,
    pub accepted: bool,
    pub requested_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CashAdvanceState {
    NotRequested,
    AwaitingReview,
    Approved,
    Rejected,
}

impl CashAdvance {
    pub fn state(&self) -> CashAdvanceState {
        match (self.requested, self.confirmed, self.accepted) {
            (_, true, true) => CashAdvanceState::Approved,
            (_, true, false) => CashAdvanceState::Rejected,
            (true, false, _) => CashAdvanceState::AwaitingReview,
            (false, false, _) => CashAdvanceState::NotRequested,
        }
    }
}

/// Invoice paying one owner company for its share of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerJobInvoice {
    pub id: OwnerInvoiceId,
    pub job_invoice_id: JobInvoiceId,
    pub job_id: JobId,
    pub owner_id: CompanyId,
    pub invoice_number: u32,
    pub job_order_number: String,
    pub owner_order_number: String,
    /// Payable to the owner, net of the owner fee unless associated
    pub amount: Money,
    /// Sum of ticket amounts before fees
    pub net_amount: Money,
    pub is_associated_invoice: bool,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_accepted_by_owner: bool,
    pub is_accepted_by_contractor: bool,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub curr_dispute: u32,
    pub cash_advance: CashAdvance,
    pub transfer_id: Option<String>,
    pub events_history: EventsHistory,
    pub version: u64,
}

impl OwnerJobInvoice {
    pub fn is_fully_accepted(&self) -> bool {
        self.is_accepted_by_owner && self.is_accepted_by_contractor
    }

    pub fn display_order_number(&self) -> String {
        dispute_order_number(&self.owner_order_number, self.curr_dispute)
    }

    /// Marks the owner invoice settled by a transfer; false when already paid
    pub fn mark_paid(&mut self, method: PaymentMethod, actor: &Actor, at: DateTime<Utc>) -> bool {
        if self.is_paid {
            return false;
        }
        self.is_paid = true;
        self.paid_at = Some(at);
        self.events_history.push(
            InvoiceEvent::new(InvoiceEventKind::Paid, at)
                .with_amount(self.amount)
                .by(actor)
                .with_data(serde_json::json!({ "method": method.as_str() })),
        );
        true
    }
}

/// A driver ticket: the smallest billable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverJobInvoice {
    pub id: DriverInvoiceId,
    pub owner_invoice_id: OwnerInvoiceId,
    pub job_invoice_id: JobInvoiceId,
    pub job_id: JobId,
    pub assignment_id: AssignmentId,
    pub driver_id: UserId,
    /// Sequential across the whole job, starting at 1
    pub ticket_number: u32,
    pub amount: Money,
    pub price: Money,
    pub commodity: CommodityKind,
    pub hours: Decimal,
    pub sum_tons: Decimal,
    pub sum_load: Decimal,
    pub is_accepted_by_owner: bool,
    pub is_accepted_by_contractor: bool,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_with: Option<String>,
    /// The billed time window
    pub time_entry: Option<TimeEntry>,
    pub loads: Vec<LoadEvent>,
    /// Dispute opened against this ticket
    pub dispute_invoice: Option<DisputeId>,
    /// Dispute whose resolution produced this ticket
    pub previous_dispute_invoice: Option<DisputeId>,
    pub curr_dispute: u32,
    pub created_at: DateTime<Utc>,
    pub events_history: EventsHistory,
    pub version: u64,
}

impl DriverJobInvoice {
    pub fn is_accepted_by(&self, party: AcceptingParty) -> bool {
        match party {
            AcceptingParty::Owner => self.is_accepted_by_owner,
            AcceptingParty::Contractor => self.is_accepted_by_contractor,
        }
    }

    pub fn set_accepted_by(&mut self, party: AcceptingParty) {
        match party {
            AcceptingParty::Owner => self.is_accepted_by_owner = true,
            AcceptingParty::Contractor => self.is_accepted_by_contractor = true,
        }
    }

    /// Dispute ids linked to this ticket in either direction
    pub fn dispute_links(&self) -> impl Iterator<Item = DisputeId> {
        self.dispute_invoice.into_iter().chain(self.previous_dispute_invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(InvoiceStatus::Created.can_transition_to(InvoiceStatus::Pending));
        assert!(InvoiceStatus::Pending.can_transition_to(InvoiceStatus::Rejected));
        assert!(InvoiceStatus::Rejected.can_transition_to(InvoiceStatus::Pending));
        assert!(!InvoiceStatus::Paid.can_transition_to(InvoiceStatus::Pending));
        assert!(!InvoiceStatus::Canceled.can_transition_to(InvoiceStatus::Paid));
    }

    #[test]
    fn test_canceled_invoice_refuses_payment() {
        let job = crate::fixtures::job_with_hourly_assignment();
        let mut invoice = crate::fixtures::job_invoice_for(&job);
        invoice.status = InvoiceStatus::Canceled;

        let result = invoice.mark_paid(PaymentMethod::Card, &Actor::System, Utc::now());
        assert!(matches!(result, Err(InvoicingError::InvalidState(_))));
        assert!(!invoice.is_paid);
        assert_eq!(invoice.events_history.count_of(InvoiceEventKind::Paid), 0);
    }

    #[test]
    fn test_mark_paid_twice_reports_duplicate() {
        let job = crate::fixtures::job_with_hourly_assignment();
        let mut invoice = crate::fixtures::job_invoice_for(&job);
        invoice.status = InvoiceStatus::Processing;

        assert!(invoice.mark_paid(PaymentMethod::Card, &Actor::System, Utc::now()).unwrap());
        assert!(!invoice.mark_paid(PaymentMethod::Card, &Actor::System, Utc::now()).unwrap());
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[test]
    fn test_dispute_order_number_suffix() {
        assert_eq!(dispute_order_number("J88-1", 0), "J88-1");
        assert_eq!(dispute_order_number("J88-1", 2), "J88-1-D2");
    }

    #[test]
    fn test_cash_advance_states() {
        let mut flags = CashAdvance::default();
        assert_eq!(flags.state(), CashAdvanceState::NotRequested);

        flags.requested = true;
        assert_eq!(flags.state(), CashAdvanceState::AwaitingReview);

        flags.confirmed = true;
        assert_eq!(flags.state(), CashAdvanceState::Rejected);

        flags.accepted = true;
        assert_eq!(flags.state(), CashAdvanceState::Approved);
    }

    #[test]
    fn test_history_counts_by_kind() {
        let now = Utc::now();
        let mut history = EventsHistory::new();
        history.push(InvoiceEvent::new(InvoiceEventKind::Created, now));
        history.push(InvoiceEvent::new(InvoiceEventKind::LateFeeCharged, now));
        history.push(InvoiceEvent::new(InvoiceEventKind::LateFeeCharged, now));

        assert_eq!(history.len(), 3);
        assert_eq!(history.count_of(InvoiceEventKind::LateFeeCharged), 2);
        assert_eq!(history.count_of(InvoiceEventKind::Paid), 0);
    }

    #[test]
    fn test_event_serializes_kind_as_type() {
        let event = InvoiceEvent::new(InvoiceEventKind::StartDispute, Utc::now()).by(&Actor::System);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "START_DISPUTE");
        assert_eq!(json["by"], "system");
    }
}
