//! Acceptance flags and the automatic acceptance sweep

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use core_kernel::{DriverInvoiceId, JobInvoiceId, OwnerInvoiceId};

use crate::error::InvoicingError;
use crate::invoice::{
    AcceptingParty, Actor, DriverJobInvoice, InvoiceEvent, InvoiceEventKind, JobInvoice,
    OwnerJobInvoice,
};
use crate::ledger::TicketLedger;
use crate::policy::BillingPolicy;
use crate::ports::{ChangeSet, InvoiceStore};
use crate::sweep::SweepReport;

fn accepted_event(party: AcceptingParty, actor: &Actor, now: DateTime<Utc>) -> InvoiceEvent {
    InvoiceEvent::new(InvoiceEventKind::Accepted, now)
        .by(actor)
        .with_data(serde_json::json!({ "party": party }))
}

/// Tracks per-party acceptance of owner and driver invoices
pub struct AcceptanceTracker {
    store: Arc<dyn InvoiceStore>,
    policy: BillingPolicy,
}

impl AcceptanceTracker {
    pub fn new(store: Arc<dyn InvoiceStore>, policy: BillingPolicy) -> Self {
        Self { store, policy }
    }

    /// Accepts a ticket on behalf of one side
    ///
    /// Accepting twice is a no-op that records no second event. When the
    /// contractor accepts the last live ticket of an owner invoice, the owner
    /// invoice becomes accepted by the contractor as well; the cascade stops
    /// there. A contractor acceptance always rewrites the owner invoice, so
    /// two sibling acceptances racing each other cannot both commit.
    ///
    /// # Errors
    ///
    /// [`InvoicingError::TicketUnderDispute`] while a dispute against the
    /// ticket is open, and an invalid state once a resolution replaced it.
    #[instrument(skip_all, fields(driver_invoice_id = %id, party = ?party))]
    pub async fn accept_driver_invoice(
        &self,
        id: DriverInvoiceId,
        party: AcceptingParty,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<DriverJobInvoice, InvoicingError> {
        let mut ticket = self.store.get_driver_invoice(id).await?;
        if ticket.is_accepted_by(party) {
            debug!("Ticket already accepted by this party");
            return Ok(ticket);
        }

        let ledger = TicketLedger::for_owner_invoice(self.store.as_ref(), ticket.owner_invoice_id).await?;
        if ledger.has_open_dispute(&ticket) {
            return Err(InvoicingError::TicketUnderDispute(id));
        }
        if ledger.is_superseded(&ticket) {
            return Err(InvoicingError::invalid_state(format!(
                "ticket {} was replaced by a dispute resolution",
                id
            )));
        }

        ticket.set_accepted_by(party);
        ticket.events_history.push(accepted_event(party, &actor, now));

        let mut changes = ChangeSet::new();
        if party == AcceptingParty::Contractor {
            let mut owner = self.store.get_owner_invoice(ticket.owner_invoice_id).await?;
            let all_accepted = ledger
                .tickets()
                .iter()
                .filter(|s| !ledger.is_superseded(s))
                .all(|s| s.id == ticket.id || s.is_accepted_by_contractor);

            if all_accepted && !owner.is_accepted_by_contractor {
                owner.is_accepted_by_contractor = true;
                owner.events_history.push(accepted_event(party, &actor, now));
                info!(owner_invoice_id = %owner.id, "All tickets accepted, owner invoice accepted by contractor");
            }
            changes.update(owner);
        }
        changes.update(ticket);
        self.store.commit(changes).await?;

        Ok(self.store.get_driver_invoice(id).await?)
    }

    /// Accepts an owner invoice on behalf of one side, without cascading
    #[instrument(skip_all, fields(owner_invoice_id = %id, party = ?party))]
    pub async fn accept_owner_invoice(
        &self,
        id: OwnerInvoiceId,
        party: AcceptingParty,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<OwnerJobInvoice, InvoicingError> {
        let mut invoice = self.store.get_owner_invoice(id).await?;
        let already = match party {
            AcceptingParty::Owner => invoice.is_accepted_by_owner,
            AcceptingParty::Contractor => invoice.is_accepted_by_contractor,
        };
        if already {
            return Ok(invoice);
        }

        match party {
            AcceptingParty::Owner => invoice.is_accepted_by_owner = true,
            AcceptingParty::Contractor => invoice.is_accepted_by_contractor = true,
        }
        invoice.events_history.push(accepted_event(party, &actor, now));

        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        Ok(self.store.get_owner_invoice(id).await?)
    }

    /// Contractor acceptance of the job invoice
    #[instrument(skip_all, fields(job_invoice_id = %id))]
    pub async fn accept_job_invoice(
        &self,
        id: JobInvoiceId,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<JobInvoice, InvoicingError> {
        let mut invoice = self.store.get_job_invoice(id).await?;
        if invoice.is_accepted {
            return Ok(invoice);
        }

        invoice.is_accepted = true;
        invoice
            .events_history
            .push(accepted_event(AcceptingParty::Contractor, &actor, now));

        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        Ok(self.store.get_job_invoice(id).await?)
    }

    /// Force-accepts stale owner invoices on both sides
    ///
    /// An owner invoice qualifies when none of its tickets has an open
    /// dispute and it is past its due date or older than the auto-accept
    /// window. Each invoice is committed on its own; a failure is logged and
    /// the sweep moves on.
    #[instrument(skip_all)]
    pub async fn run_auto_accept_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, InvoicingError> {
        let candidates = self.store.owner_invoices_pending_acceptance().await?;
        let mut report = SweepReport::default();

        for invoice in candidates {
            report.examined += 1;
            let id = invoice.id;
            match self.auto_accept(invoice, now).await {
                Ok(true) => report.changed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(owner_invoice_id = %id, error = %e, "Auto-accept failed");
                }
            }
        }

        info!(
            examined = report.examined,
            accepted = report.changed,
            failed = report.failed,
            "Auto-accept sweep finished"
        );
        Ok(report)
    }

    async fn auto_accept(&self, mut invoice: OwnerJobInvoice, now: DateTime<Utc>) -> Result<bool, InvoicingError> {
        let expired = now > invoice.due_date || now > invoice.created_at + self.policy.auto_accept_after();
        if !expired {
            return Ok(false);
        }

        let ledger = TicketLedger::for_owner_invoice(self.store.as_ref(), invoice.id).await?;
        if ledger.tickets().iter().any(|t| ledger.has_open_dispute(t)) {
            return Ok(false);
        }

        let event = || {
            InvoiceEvent::new(InvoiceEventKind::AutoAccepted, now)
                .by(&Actor::System)
        };

        let mut changes = ChangeSet::new();
        invoice.is_accepted_by_owner = true;
        invoice.is_accepted_by_contractor = true;
        invoice.events_history.push(event());
        changes.update(invoice);

        // every ticket is rewritten so a dispute opened meanwhile conflicts
        for mut ticket in ledger.into_tickets() {
            if !(ticket.is_accepted_by_owner && ticket.is_accepted_by_contractor) {
                ticket.is_accepted_by_owner = true;
                ticket.is_accepted_by_contractor = true;
                ticket.events_history.push(event());
            }
            changes.update(ticket);
        }

        self.store.commit(changes).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use chrono::Duration;

    #[tokio::test]
    async fn test_accepting_twice_records_one_event() {
        let harness = Harness::generated_two_owner_job().await;
        let tracker = harness.acceptance();
        let ticket = harness.tickets().await.remove(0);

        tracker
            .accept_driver_invoice(ticket.id, AcceptingParty::Owner, harness.owner_actor(), fixtures::now())
            .await
            .unwrap();
        let after = tracker
            .accept_driver_invoice(ticket.id, AcceptingParty::Owner, harness.owner_actor(), fixtures::now())
            .await
            .unwrap();

        assert_eq!(after.events_history.count_of(InvoiceEventKind::Accepted), 1);
        assert!(after.is_accepted_by_owner);
        assert!(!after.is_accepted_by_contractor);
    }

    #[tokio::test]
    async fn test_contractor_acceptance_cascades_one_level_when_all_siblings_accept() {
        let harness = Harness::generated_two_owner_job().await;
        let tracker = harness.acceptance();
        let owner = harness.owner_invoices().await.remove(0);
        let tickets = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        assert_eq!(tickets.len(), 2);

        tracker
            .accept_driver_invoice(tickets[0].id, AcceptingParty::Contractor, harness.contractor_actor(), fixtures::now())
            .await
            .unwrap();
        let partially = harness.store.get_owner_invoice(owner.id).await.unwrap();
        assert!(!partially.is_accepted_by_contractor);

        tracker
            .accept_driver_invoice(tickets[1].id, AcceptingParty::Contractor, harness.contractor_actor(), fixtures::now())
            .await
            .unwrap();
        let accepted = harness.store.get_owner_invoice(owner.id).await.unwrap();
        assert!(accepted.is_accepted_by_contractor);
        assert!(!accepted.is_accepted_by_owner);

        let job_invoice = harness.store.get_job_invoice(owner.job_invoice_id).await.unwrap();
        assert!(!job_invoice.is_accepted);
    }

    #[tokio::test]
    async fn test_auto_accept_waits_for_window() {
        let harness = Harness::generated_two_owner_job().await;
        let tracker = harness.acceptance();

        let early = tracker.run_auto_accept_sweep(fixtures::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(early.changed, 0);
        assert_eq!(early.skipped, 2);

        let late = tracker.run_auto_accept_sweep(fixtures::now() + Duration::hours(49)).await.unwrap();
        assert_eq!(late.changed, 2);

        for ticket in harness.tickets().await {
            assert!(ticket.is_accepted_by_owner && ticket.is_accepted_by_contractor);
            assert_eq!(ticket.events_history.count_of(InvoiceEventKind::AutoAccepted), 1);
        }
    }

    #[tokio::test]
    async fn test_auto_accept_skips_invoices_with_open_disputes() {
        let harness = Harness::generated_two_owner_job().await;
        let ticket = harness.tickets().await.remove(0);
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(ticket.id, &harness), fixtures::now())
            .await
            .unwrap();

        let report = harness
            .acceptance()
            .run_auto_accept_sweep(fixtures::now() + Duration::days(30))
            .await
            .unwrap();

        assert_eq!(report.changed, 1);
        let disputed_owner = harness.store.get_owner_invoice(ticket.owner_invoice_id).await.unwrap();
        assert!(!disputed_owner.is_accepted_by_owner);
    }

    #[tokio::test]
    async fn test_disputed_ticket_cannot_be_accepted() {
        let harness = Harness::generated_two_owner_job().await;
        let ticket = harness.tickets().await.remove(0);
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(ticket.id, &harness), fixtures::now())
            .await
            .unwrap();

        for party in [AcceptingParty::Owner, AcceptingParty::Contractor] {
            let err = harness
                .acceptance()
                .accept_driver_invoice(ticket.id, party, harness.contractor_actor(), fixtures::now())
                .await
                .unwrap_err();
            assert!(matches!(err, InvoicingError::TicketUnderDispute(id) if id == ticket.id));
        }
        let stored = harness.store.get_driver_invoice(ticket.id).await.unwrap();
        assert!(!stored.is_accepted_by_owner && !stored.is_accepted_by_contractor);
    }

    #[tokio::test]
    async fn test_replaced_ticket_cannot_be_accepted() {
        let harness = Harness::generated_two_owner_job().await;
        let ticket = harness.tickets().await.remove(0);
        harness.dispute_and_uphold(ticket.id).await;

        let err = harness
            .acceptance()
            .accept_driver_invoice(ticket.id, AcceptingParty::Owner, harness.owner_actor(), fixtures::now())
            .await
            .unwrap_err();
        assert!(matches!(err, InvoicingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_contractor_acceptance_rewrites_owner_invoice() {
        let harness = Harness::generated_two_owner_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        let tickets = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        let before = harness.store.get_owner_invoice(owner.id).await.unwrap();

        harness
            .acceptance()
            .accept_driver_invoice(tickets[0].id, AcceptingParty::Contractor, harness.contractor_actor(), fixtures::now())
            .await
            .unwrap();

        let after = harness.store.get_owner_invoice(owner.id).await.unwrap();
        assert!(!after.is_accepted_by_contractor);
        assert!(after.version > before.version);
    }
}
