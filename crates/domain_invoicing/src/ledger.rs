//! Which tickets still carry money
//!
//! Resolving a dispute writes a replacement ticket one level deeper and
//! leaves the disputed ticket in place for audit. From then on only the
//! replacement is billed and paid out. A ticket under an open dispute is
//! held back until the dispute is DONE.
//!
//! Checkout amounts, owner transfers, transfer settlement, acceptance and
//! late fees all read the same [`TicketLedger`], so a superseded ticket is
//! never charged or paid twice.
//!
//! # Billable rule
//!
//! - A ticket with no dispute link is billable.
//! - A ticket replaced by a DONE dispute is never billable.
//! - A ticket with dispute links is billable once every linked dispute is
//!   DONE and it is the only ticket under its owner invoice.

use std::collections::HashMap;

use core_kernel::{Currency, DisputeId, JobInvoiceId, Money, MoneyError, OwnerInvoiceId, PortError};

use crate::dispute::DisputeInvoice;
use crate::invoice::DriverJobInvoice;
use crate::ports::InvoiceStore;

/// Tickets of one owner or job invoice together with every dispute they link to
#[derive(Debug, Clone, Default)]
pub struct TicketLedger {
    tickets: Vec<DriverJobInvoice>,
    disputes: HashMap<DisputeId, DisputeInvoice>,
    per_owner: HashMap<OwnerInvoiceId, usize>,
}

impl TicketLedger {
    pub fn new(tickets: Vec<DriverJobInvoice>, disputes: HashMap<DisputeId, DisputeInvoice>) -> Self {
        let mut per_owner: HashMap<OwnerInvoiceId, usize> = HashMap::new();
        for ticket in &tickets {
            *per_owner.entry(ticket.owner_invoice_id).or_default() += 1;
        }
        Self {
            tickets,
            disputes,
            per_owner,
        }
    }

    /// Loads the tickets of an owner invoice and their disputes
    pub async fn for_owner_invoice(store: &dyn InvoiceStore, id: OwnerInvoiceId) -> Result<Self, PortError> {
        let tickets = store.driver_invoices_for_owner_invoice(id).await?;
        Self::with_disputes(store, tickets).await
    }

    /// Loads every ticket under a job invoice and their disputes
    pub async fn for_job_invoice(store: &dyn InvoiceStore, id: JobInvoiceId) -> Result<Self, PortError> {
        let mut tickets = Vec::new();
        for owner in store.owner_invoices_for_job_invoice(id).await? {
            tickets.extend(store.driver_invoices_for_owner_invoice(owner.id).await?);
        }
        Self::with_disputes(store, tickets).await
    }

    async fn with_disputes(store: &dyn InvoiceStore, tickets: Vec<DriverJobInvoice>) -> Result<Self, PortError> {
        let mut disputes = HashMap::new();
        for id in tickets.iter().flat_map(DriverJobInvoice::dispute_links) {
            if !disputes.contains_key(&id) {
                disputes.insert(id, store.get_dispute(id).await?);
            }
        }
        Ok(Self::new(tickets, disputes))
    }

    /// Replaces a loaded dispute with a version that is not committed yet
    pub fn with_dispute(mut self, dispute: DisputeInvoice) -> Self {
        self.disputes.insert(dispute.id, dispute);
        self
    }

    pub fn tickets(&self) -> &[DriverJobInvoice] {
        &self.tickets
    }

    pub fn into_tickets(self) -> Vec<DriverJobInvoice> {
        self.tickets
    }

    /// True once a DONE dispute replaced the ticket
    pub fn is_superseded(&self, ticket: &DriverJobInvoice) -> bool {
        ticket
            .dispute_links()
            .filter_map(|id| self.disputes.get(&id))
            .any(|d| d.is_done() && d.previous_driver_invoice == Some(ticket.id))
    }

    /// True while the dispute opened against the ticket is not DONE
    ///
    /// A link to a dispute this ledger did not load counts as open.
    pub fn has_open_dispute(&self, ticket: &DriverJobInvoice) -> bool {
        ticket
            .dispute_invoice
            .is_some_and(|id| !self.disputes.get(&id).is_some_and(DisputeInvoice::is_done))
    }

    pub fn is_billable(&self, ticket: &DriverJobInvoice) -> bool {
        let mut links = ticket.dispute_links().peekable();
        if links.peek().is_none() {
            return true;
        }
        if self.is_superseded(ticket) {
            return false;
        }
        let all_done = links.all(|id| self.disputes.get(&id).is_some_and(DisputeInvoice::is_done));
        all_done && self.per_owner.get(&ticket.owner_invoice_id) == Some(&1)
    }

    pub fn billable(&self) -> impl Iterator<Item = &DriverJobInvoice> {
        self.tickets.iter().filter(|t| self.is_billable(t))
    }

    /// Sum of the billable tickets
    pub fn billable_total(&self, currency: Currency) -> Result<Money, MoneyError> {
        Money::try_sum(self.billable().map(|t| &t.amount), currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispute::DisputeStatus;
    use crate::fixtures::{self, Harness};
    use rust_decimal_macros::dec;

    fn ledger(tickets: Vec<DriverJobInvoice>, disputes: Vec<DisputeInvoice>) -> TicketLedger {
        TicketLedger::new(tickets, disputes.into_iter().map(|d| (d.id, d)).collect())
    }

    #[test]
    fn test_open_dispute_is_held_back() {
        let mut first = fixtures::hourly_ticket(dec!(50), 4);
        let mut second = fixtures::hourly_ticket(dec!(50), 2);
        second.owner_invoice_id = first.owner_invoice_id;

        let dispute = fixtures::dispute_for(&first, DisputeStatus::Pending);
        first.dispute_invoice = Some(dispute.id);
        let ledger = ledger(vec![first.clone(), second], vec![dispute]);

        assert!(ledger.has_open_dispute(&first));
        assert!(!ledger.is_superseded(&first));
        assert_eq!(ledger.billable_total(Currency::USD).unwrap().amount(), dec!(100.00));
    }

    #[test]
    fn test_superseded_ticket_gives_way_to_sole_successor() {
        let mut disputed = fixtures::hourly_ticket(dec!(50), 4);
        let mut successor = fixtures::hourly_ticket(dec!(50), 3);

        let dispute = fixtures::dispute_for(&disputed, DisputeStatus::Done);
        disputed.dispute_invoice = Some(dispute.id);
        successor.previous_dispute_invoice = Some(dispute.id);
        let ledger = ledger(vec![disputed.clone(), successor.clone()], vec![dispute]);

        assert!(ledger.is_superseded(&disputed));
        assert!(!ledger.has_open_dispute(&disputed));
        assert!(ledger.is_billable(&successor));
        assert_eq!(ledger.billable_total(Currency::USD).unwrap().amount(), dec!(150.00));
    }

    #[test]
    fn test_done_dispute_with_siblings_does_not_count() {
        let mut resolved = fixtures::hourly_ticket(dec!(50), 4);
        let mut sibling = fixtures::hourly_ticket(dec!(50), 1);
        sibling.owner_invoice_id = resolved.owner_invoice_id;

        let dispute = fixtures::dispute_for(&sibling, DisputeStatus::Done);
        resolved.previous_dispute_invoice = Some(dispute.id);
        let ledger = ledger(vec![resolved, sibling], vec![dispute]);

        assert_eq!(ledger.billable_total(Currency::USD).unwrap().amount(), dec!(50.00));
    }

    #[test]
    fn test_unloaded_dispute_counts_as_open() {
        let mut ticket = fixtures::hourly_ticket(dec!(50), 4);
        ticket.dispute_invoice = Some(DisputeId::new_v7());
        let ledger = ledger(vec![ticket.clone()], Vec::new());

        assert!(ledger.has_open_dispute(&ticket));
        assert!(ledger.billable_total(Currency::USD).unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_job_ledger_spans_every_owner_invoice() {
        let harness = Harness::generated_two_owner_job().await;
        let job_invoice = harness.job_invoice().await;
        let disputed = harness.tickets().await.remove(0);
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(disputed.id, &harness), fixtures::now())
            .await
            .unwrap();

        let ledger = TicketLedger::for_job_invoice(harness.store.as_ref(), job_invoice.id).await.unwrap();
        assert_eq!(ledger.tickets().len(), 3);
        assert_eq!(ledger.billable_total(Currency::USD).unwrap().amount(), dec!(690.00));

        let owner = TicketLedger::for_owner_invoice(harness.store.as_ref(), disputed.owner_invoice_id)
            .await
            .unwrap();
        assert_eq!(owner.billable_total(Currency::USD).unwrap().amount(), dec!(240.00));
    }
}
