//! Early owner payouts against a cash-advance fee

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use core_kernel::{Money, OwnerInvoiceId};

use crate::error::InvoicingError;
use crate::invoice::{Actor, CashAdvanceState, InvoiceEvent, InvoiceEventKind, OwnerJobInvoice};
use crate::ledger::TicketLedger;
use crate::notifications::{plan_admin_broadcast, plan_company, Channel, NotificationDispatcher, Topic};
use crate::payout::PayoutService;
use crate::policy::BillingPolicy;
use crate::ports::{ChangeSet, InvoiceStore, PartyDirectory};

/// Amount paid out early: net minus the owner fee and the cash-advance fee
///
/// Associated invoices carry no owner fee, so only the cash-advance fee is
/// withheld from them.
pub fn cash_advance_amount(net: Money, associated: bool, policy: &BillingPolicy) -> Money {
    let owner_fee = if associated {
        Money::zero(net.currency())
    } else {
        policy.owner_fee.apply(&net)
    };
    (net - owner_fee - policy.cash_advance_fee.apply(&net)).round_to_currency()
}

pub struct CashAdvanceWorkflow {
    store: Arc<dyn InvoiceStore>,
    directory: Arc<dyn PartyDirectory>,
    payouts: PayoutService,
    dispatcher: NotificationDispatcher,
    policy: BillingPolicy,
}

impl CashAdvanceWorkflow {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        directory: Arc<dyn PartyDirectory>,
        payouts: PayoutService,
        dispatcher: NotificationDispatcher,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            payouts,
            dispatcher,
            policy,
        }
    }

    /// Owner request for an early payout
    ///
    /// One-shot: a second request is refused whether the first is pending,
    /// approved or rejected.
    #[instrument(skip_all, fields(owner_invoice_id = %id))]
    pub async fn request_cash_advance(
        &self,
        id: OwnerInvoiceId,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<OwnerJobInvoice, InvoicingError> {
        let mut invoice = self.store.get_owner_invoice(id).await?;
        if invoice.is_paid {
            return Err(InvoicingError::InvoiceAlreadyPaid(invoice.display_order_number()));
        }
        match invoice.cash_advance.state() {
            CashAdvanceState::Rejected => return Err(InvoicingError::CashAdvanceAlreadyRejected(id)),
            CashAdvanceState::AwaitingReview | CashAdvanceState::Approved => {
                return Err(InvoicingError::AlreadyAppliedForCashAdvance(id))
            }
            CashAdvanceState::NotRequested => {}
        }

        invoice.cash_advance.requested = true;
        invoice.cash_advance.requested_at = Some(now);
        invoice
            .events_history
            .push(InvoiceEvent::new(InvoiceEventKind::CashAdvanceRequested, now).by(&actor));

        let data = serde_json::json!({
            "orderNumber": invoice.display_order_number(),
            "netAmount": invoice.net_amount,
        });
        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        info!("Cash advance requested");

        match self.directory.admins().await {
            Ok(admins) => {
                self.dispatcher
                    .dispatch(plan_admin_broadcast(&admins, Topic::CashAdvanceRequested, data))
                    .await;
            }
            Err(e) => warn!(error = %e, "Admin lookup failed, cash advance request not announced"),
        }

        Ok(self.store.get_owner_invoice(id).await?)
    }

    /// Admin decision on a pending request
    ///
    /// On approval the owner invoice amount becomes the cash-advance amount of
    /// its billable net and the transfer is created right away. A failed
    /// transfer is returned as a retryable error; the approval itself stays
    /// committed and the transfer sweep retries it.
    #[instrument(skip_all, fields(owner_invoice_id = %id, confirm))]
    pub async fn review_cash_advance(
        &self,
        id: OwnerInvoiceId,
        confirm: bool,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<OwnerJobInvoice, InvoicingError> {
        let mut invoice = self.store.get_owner_invoice(id).await?;
        match invoice.cash_advance.state() {
            CashAdvanceState::NotRequested => return Err(InvoicingError::NoCashAdvanceRequested(id)),
            CashAdvanceState::Approved | CashAdvanceState::Rejected => {
                return Err(InvoicingError::invalid_state(format!(
                    "cash advance for owner invoice {} was already reviewed",
                    id
                )))
            }
            CashAdvanceState::AwaitingReview => {}
        }
        if invoice.is_paid {
            return Err(InvoicingError::InvoiceAlreadyPaid(invoice.display_order_number()));
        }

        let owner = self.directory.company(invoice.owner_id).await?;
        let billable = TicketLedger::for_owner_invoice(self.store.as_ref(), id)
            .await?
            .billable_total(invoice.net_amount.currency())?;
        if confirm && billable.is_zero() {
            return Err(InvoicingError::invalid_state(format!(
                "{} has no billable tickets to advance",
                invoice.display_order_number()
            )));
        }

        invoice.cash_advance.confirmed = true;
        invoice.cash_advance.accepted = confirm;
        invoice.cash_advance.reviewed_at = Some(now);
        if confirm {
            invoice.amount = cash_advance_amount(billable, invoice.is_associated_invoice, &self.policy);
            invoice.events_history.push(
                InvoiceEvent::new(InvoiceEventKind::CashAdvanceConfirmed, now)
                    .with_amount(invoice.amount)
                    .by(&actor),
            );
        } else {
            invoice
                .events_history
                .push(InvoiceEvent::new(InvoiceEventKind::CashAdvanceRejected, now).by(&actor));
        }

        let data = serde_json::json!({
            "orderNumber": invoice.display_order_number(),
            "approved": confirm,
            "amount": invoice.amount,
        });
        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        info!(approved = confirm, "Cash advance reviewed");

        self.dispatcher
            .dispatch(plan_company(
                &owner,
                &[Channel::Sms, Channel::Push, Channel::Email],
                Topic::CashAdvanceReviewed,
                data,
            ))
            .await;

        if confirm {
            self.payouts.transfer_to_owner(id, now).await?;
        }
        Ok(self.store.get_owner_invoice(id).await?)
    }
}
