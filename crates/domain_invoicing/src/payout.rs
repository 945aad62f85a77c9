//! Owner payout transfers

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use core_kernel::{Money, OwnerInvoiceId};

use crate::cash_advance::cash_advance_amount;
use crate::error::InvoicingError;
use crate::generator::owner_payable;
use crate::invoice::{Actor, CashAdvanceState, InvoiceEvent, InvoiceEventKind, OwnerJobInvoice};
use crate::ledger::TicketLedger;
use crate::policy::BillingPolicy;
use crate::ports::{ChangeSet, InvoiceStore, PartyDirectory, PaymentGateway};
use crate::sweep::SweepReport;

/// Amount owed to the owner for the billable part of an owner invoice
///
/// Equals the stored `amount` while every ticket is billable. Once a dispute
/// has replaced a ticket, the fees are withheld from the remaining billable
/// net the same way generation and cash-advance review withhold them.
pub(crate) fn owner_transfer_amount(
    invoice: &OwnerJobInvoice,
    billable_net: Money,
    policy: &BillingPolicy,
) -> Money {
    if billable_net == invoice.net_amount {
        invoice.amount
    } else if invoice.cash_advance.state() == CashAdvanceState::Approved {
        cash_advance_amount(billable_net, invoice.is_associated_invoice, policy)
    } else {
        owner_payable(billable_net, invoice.is_associated_invoice, policy)
    }
}

/// Sends owner invoice amounts to the owners' payout accounts
///
/// A transfer only records `transfer_id`; the owner invoice is marked paid
/// when the payment rail confirms the transfer. Tickets replaced by a
/// dispute resolution are left out of the transferred amount.
#[derive(Clone)]
pub struct PayoutService {
    store: Arc<dyn InvoiceStore>,
    directory: Arc<dyn PartyDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    policy: BillingPolicy,
}

impl PayoutService {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        directory: Arc<dyn PartyDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            gateway,
            policy,
        }
    }

    /// Creates the payout transfer of an owner invoice
    ///
    /// Returns the existing transfer id when one was already created. The
    /// owner invoice id is the gateway idempotency key, so a retry after a
    /// failed commit reuses the same transfer.
    #[instrument(skip_all, fields(owner_invoice_id = %id))]
    pub async fn transfer_to_owner(&self, id: OwnerInvoiceId, now: DateTime<Utc>) -> Result<String, InvoicingError> {
        let mut invoice = self.store.get_owner_invoice(id).await?;
        if let Some(existing) = &invoice.transfer_id {
            return Ok(existing.clone());
        }
        if invoice.is_paid {
            return Err(InvoicingError::InvoiceAlreadyPaid(invoice.display_order_number()));
        }

        let ledger = TicketLedger::for_owner_invoice(self.store.as_ref(), id).await?;
        let billable = ledger.billable_total(invoice.net_amount.currency())?;
        if billable.is_zero() {
            return Err(InvoicingError::invalid_state(format!(
                "{} has no billable tickets left to pay out",
                invoice.display_order_number()
            )));
        }
        let amount = owner_transfer_amount(&invoice, billable, &self.policy);

        let owner = self.directory.company(invoice.owner_id).await?;
        let account = owner.payout_account.as_deref().ok_or_else(|| {
            InvoicingError::UnverifiedBankAccount(format!("company {} has no payout account", owner.id))
        })?;

        let transfer_id = self
            .gateway
            .create_transfer(amount, account, &invoice.id.to_string())
            .await?;

        invoice.transfer_id = Some(transfer_id.clone());
        invoice.events_history.push(
            InvoiceEvent::new(InvoiceEventKind::TransferCreated, now)
                .with_amount(amount)
                .by(&Actor::System)
                .with_data(serde_json::json!({ "transferId": transfer_id })),
        );
        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;

        info!(transfer_id = %transfer_id, amount = %amount, "Owner payout transfer created");
        Ok(transfer_id)
    }

    /// Pays out every owner invoice that became due
    ///
    /// Invoices reached through an approved cash advance are normally paid out
    /// at review time; the sweep picks up any whose transfer failed then.
    #[instrument(skip_all)]
    pub async fn run_transfer_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, InvoicingError> {
        let candidates = self.store.owner_invoices_awaiting_payout(now).await?;
        let mut report = SweepReport::default();

        for invoice in candidates {
            report.examined += 1;
            let id = invoice.id;
            match self.ready_for_payout(&invoice).await {
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(owner_invoice_id = %id, error = %e, "Payout eligibility check failed");
                    continue;
                }
            }

            match self.transfer_to_owner(id, now).await {
                Ok(_) => report.changed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(owner_invoice_id = %id, error = %e, retryable = e.is_retryable(), "Owner payout failed");
                }
            }
        }

        info!(
            examined = report.examined,
            transferred = report.changed,
            failed = report.failed,
            "Transfer sweep finished"
        );
        Ok(report)
    }

    async fn ready_for_payout(&self, invoice: &OwnerJobInvoice) -> Result<bool, InvoicingError> {
        let ledger = TicketLedger::for_owner_invoice(self.store.as_ref(), invoice.id).await?;
        if ledger.billable_total(invoice.net_amount.currency())?.is_zero() {
            return Ok(false);
        }
        if invoice.cash_advance.state() == CashAdvanceState::Approved {
            return Ok(true);
        }
        if !invoice.is_fully_accepted() {
            return Ok(false);
        }
        Ok(!ledger.tickets().iter().any(|t| ledger.has_open_dispute(t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use crate::invoice::{AcceptingParty, PaymentMethod};
    use crate::ports::mock::GatewayCall;
    use crate::ports::GatewayError;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_transfer_is_recorded_once() {
        let harness = Harness::generated_simple_hourly_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        let payouts = harness.payouts();

        let first = payouts.transfer_to_owner(owner.id, fixtures::now()).await.unwrap();
        let second = payouts.transfer_to_owner(owner.id, fixtures::now()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(harness.payments.transfer_calls().await, 1);

        let stored = harness.store.get_owner_invoice(owner.id).await.unwrap();
        assert_eq!(stored.transfer_id, Some(first));
        assert!(!stored.is_paid);
        assert!(harness.payments.calls().await.iter().any(|c| matches!(
            c,
            GatewayCall::Transfer { amount, .. } if *amount == owner.amount
        )));
    }

    #[tokio::test]
    async fn test_sweep_waits_for_parent_payment_and_acceptance() {
        let harness = Harness::generated_simple_hourly_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        let after_due = owner.due_date + Duration::hours(1);

        let report = harness.payouts().run_transfer_sweep(after_due).await.unwrap();
        assert_eq!(report.examined, 0);

        harness.mark_job_invoice_paid(PaymentMethod::Card).await;
        let unaccepted = harness.payouts().run_transfer_sweep(after_due).await.unwrap();
        assert_eq!(unaccepted.skipped, 1);

        let acceptance = harness.acceptance();
        for party in [AcceptingParty::Owner, AcceptingParty::Contractor] {
            acceptance
                .accept_owner_invoice(owner.id, party, Actor::System, fixtures::now())
                .await
                .unwrap();
        }
        let paid_out = harness.payouts().run_transfer_sweep(after_due).await.unwrap();
        assert_eq!(paid_out.changed, 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_counts_as_failed_item() {
        let harness = Harness::generated_simple_hourly_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        harness.mark_job_invoice_paid(PaymentMethod::Card).await;
        harness.accept_everything().await;
        harness
            .payments
            .fail_next(GatewayError::BalanceInsufficient("platform balance".into()))
            .await;

        let report = harness
            .payouts()
            .run_transfer_sweep(owner.due_date + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(harness.store.get_owner_invoice(owner.id).await.unwrap().transfer_id.is_none());
    }

    #[tokio::test]
    async fn test_transfer_after_resolution_skips_replaced_ticket() {
        let harness = Harness::generated_two_owner_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        let tickets = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        harness.dispute_and_uphold(tickets[0].id).await;

        harness.payouts().transfer_to_owner(owner.id, fixtures::now()).await.unwrap();

        // 240 left on the invoice after the 200 ticket moved to the next level
        let transfers: Vec<_> = harness
            .payments
            .calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Transfer { amount, .. } => Some(amount.amount()),
                _ => None,
            })
            .collect();
        assert_eq!(transfers, vec![dec!(225.60)]);
    }

    #[tokio::test]
    async fn test_sweep_skips_invoice_with_every_ticket_replaced() {
        let harness = Harness::generated_two_owner_job().await;
        let replaced = harness.owner_invoices().await.remove(1);
        let tickets = harness.store.driver_invoices_for_owner_invoice(replaced.id).await.unwrap();
        assert_eq!(tickets.len(), 1);
        harness.dispute_and_uphold(tickets[0].id).await;

        harness.mark_job_invoice_paid(PaymentMethod::Card).await;
        harness.accept_everything().await;
        let report = harness
            .payouts()
            .run_transfer_sweep(replaced.due_date + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(harness.payments.transfer_calls().await, 1);
        let stored = harness.store.get_owner_invoice(replaced.id).await.unwrap();
        assert!(stored.transfer_id.is_none());

        let err = harness
            .payouts()
            .transfer_to_owner(replaced.id, fixtures::now())
            .await
            .unwrap_err();
        assert!(matches!(err, InvoicingError::InvalidState(_)));
    }
}
