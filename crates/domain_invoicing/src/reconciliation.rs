//! Payment-rail callbacks, checkout, manual payments and discounts
//!
//! Callbacks are keyed by the correlation id the rail echoes back (payment
//! intent, external invoice, charge or transfer id). A repeated delivery is
//! answered with [`ReconcileOutcome::Duplicate`] and changes nothing.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument};

use core_kernel::{DriverInvoiceId, JobInvoiceId, LateFeeInvoiceId, ManualPaymentId, Money};

use crate::error::InvoicingError;
use crate::invoice::{
    Actor, DriverJobInvoice, InvoiceEvent, InvoiceEventKind, InvoiceStatus, JobInvoice, Payable,
    PaymentMethod,
};
use crate::late_fee::LateFeeInvoice;
use crate::ledger::TicketLedger;
use crate::payment::{ManualPayment, ManualPaymentRequest, PaymentTarget};
use crate::ports::{ChangeSet, InvoiceStore, Payer, PaymentChannel, PaymentGateway, PaymentIntent, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// The event was already reflected in the invoice
    Duplicate,
}

/// A job invoice or late fee, loaded for a payment operation
#[derive(Debug, Clone)]
enum PayableRecord {
    Job(JobInvoice),
    LateFee(LateFeeInvoice),
}

impl PayableRecord {
    fn payable(&self) -> &dyn Payable {
        match self {
            PayableRecord::Job(r) => r,
            PayableRecord::LateFee(r) => r,
        }
    }

    fn payable_mut(&mut self) -> &mut dyn Payable {
        match self {
            PayableRecord::Job(r) => r,
            PayableRecord::LateFee(r) => r,
        }
    }
}

impl From<PayableRecord> for Record {
    fn from(record: PayableRecord) -> Self {
        match record {
            PayableRecord::Job(r) => r.into(),
            PayableRecord::LateFee(r) => r.into(),
        }
    }
}

fn checkout_event(kind: InvoiceEventKind, now: DateTime<Utc>, actor: &Actor, data: serde_json::Value) -> InvoiceEvent {
    InvoiceEvent::new(kind, now).by(actor).with_data(data)
}

/// Method recorded by the last checkout, card when none is known
fn checkout_method(invoice: &JobInvoice) -> PaymentMethod {
    let channel = invoice
        .events_history
        .iter()
        .filter(|e| e.kind == InvoiceEventKind::PaymentProcessing)
        .last()
        .and_then(|e| e.data.get("channel").and_then(|c| c.as_str()).map(str::to_owned));
    match channel.as_deref() {
        Some("bank") => PaymentMethod::Bank,
        _ => PaymentMethod::Card,
    }
}

fn correlation_miss(kind: &'static str, id: &str) -> InvoicingError {
    error!(correlation = kind, id = %id, "Payment event references no known invoice");
    InvoicingError::CorrelationNotFound {
        kind,
        id: id.to_string(),
    }
}

pub struct PaymentReconciler {
    store: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentReconciler {
    pub fn new(store: Arc<dyn InvoiceStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    async fn settle(
        &self,
        mut record: PayableRecord,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, InvoicingError> {
        if !record.payable_mut().mark_paid(method, &Actor::System, now)? {
            return Ok(ReconcileOutcome::Duplicate);
        }
        let order_number = record.payable().display_order_number();
        let mut changes = ChangeSet::new();
        changes.update(record);
        self.store.commit(changes).await?;
        info!(order_number = %order_number, method = method.as_str(), "Invoice paid");
        Ok(ReconcileOutcome::Applied)
    }

    /// The checkout payment intent of a job invoice succeeded
    #[instrument(skip(self, now))]
    pub async fn intent_paid(&self, intent_id: &str, now: DateTime<Utc>) -> Result<ReconcileOutcome, InvoicingError> {
        let invoice = self
            .store
            .job_invoice_by_payment_intent(intent_id)
            .await?
            .ok_or_else(|| correlation_miss("payment intent", intent_id))?;
        let method = checkout_method(&invoice);
        self.settle(PayableRecord::Job(invoice), method, now).await
    }

    /// The external gateway invoice was paid
    #[instrument(skip(self, now))]
    pub async fn invoice_paid(
        &self,
        external_invoice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, InvoicingError> {
        let invoice = self
            .store
            .job_invoice_by_external_invoice(external_invoice_id)
            .await?
            .ok_or_else(|| correlation_miss("external invoice", external_invoice_id))?;
        self.settle(PayableRecord::Job(invoice), PaymentMethod::ExternalInvoice, now)
            .await
    }

    /// A late-fee charge settled
    #[instrument(skip(self, now))]
    pub async fn charge_paid(&self, charge_id: &str, now: DateTime<Utc>) -> Result<ReconcileOutcome, InvoicingError> {
        let fee = self
            .store
            .late_fee_by_charge(charge_id)
            .await?
            .ok_or_else(|| correlation_miss("charge", charge_id))?;
        self.settle(PayableRecord::LateFee(fee), PaymentMethod::Card, now).await
    }

    /// A late-fee charge was accepted but not settled yet
    #[instrument(skip(self, now))]
    pub async fn charge_pending(&self, charge_id: &str, now: DateTime<Utc>) -> Result<ReconcileOutcome, InvoicingError> {
        let mut fee = self
            .store
            .late_fee_by_charge(charge_id)
            .await?
            .ok_or_else(|| correlation_miss("charge", charge_id))?;
        if fee.is_paid || fee.status == InvoiceStatus::Processing {
            return Ok(ReconcileOutcome::Duplicate);
        }
        if !fee.status.can_transition_to(InvoiceStatus::Processing) {
            return Err(InvoicingError::invalid_state(format!(
                "late fee {} cannot move from {} to PROCESSING",
                fee.order_number, fee.status
            )));
        }

        fee.status = InvoiceStatus::Processing;
        fee.events_history.push(checkout_event(
            InvoiceEventKind::PaymentProcessing,
            now,
            &Actor::System,
            serde_json::json!({ "chargeId": charge_id }),
        ));
        let mut changes = ChangeSet::new();
        changes.update(fee);
        self.store.commit(changes).await?;
        Ok(ReconcileOutcome::Applied)
    }

    /// An owner payout transfer settled
    ///
    /// Marks the owner invoice and its billable tickets paid. Tickets with an
    /// open dispute stay unpaid, and so do tickets a dispute resolution
    /// replaced; their successors are paid by their own transfer.
    #[instrument(skip(self, now))]
    pub async fn transfer_paid(&self, transfer_id: &str, now: DateTime<Utc>) -> Result<ReconcileOutcome, InvoicingError> {
        let mut owner = self
            .store
            .owner_invoice_by_transfer(transfer_id)
            .await?
            .ok_or_else(|| correlation_miss("transfer", transfer_id))?;
        if !owner.mark_paid(PaymentMethod::Transfer, &Actor::System, now) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let ledger = TicketLedger::for_owner_invoice(self.store.as_ref(), owner.id).await?;
        let settled: Vec<DriverJobInvoice> = ledger
            .tickets()
            .iter()
            .filter(|t| !t.is_paid && ledger.is_billable(t))
            .cloned()
            .collect();

        let mut changes = ChangeSet::new();
        for mut ticket in settled {
            pay_ticket(&mut ticket, PaymentMethod::Transfer, &Actor::System, now);
            changes.update(ticket);
        }
        let owner_invoice_id = owner.id;
        changes.update(owner);
        self.store.commit(changes).await?;

        info!(owner_invoice_id = %owner_invoice_id, transfer_id, "Owner invoice paid by transfer");
        Ok(ReconcileOutcome::Applied)
    }

    /// Marks a single ticket paid
    ///
    /// # Errors
    ///
    /// - `TicketUnderDispute` while the ticket's dispute is not DONE
    /// - `InvalidState` if a dispute resolution replaced the ticket
    #[instrument(skip(self, actor, now))]
    pub async fn mark_driver_invoice_paid(
        &self,
        id: DriverInvoiceId,
        method: PaymentMethod,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<DriverJobInvoice, InvoicingError> {
        let mut ticket = self.store.get_driver_invoice(id).await?;
        let ledger = TicketLedger::for_owner_invoice(self.store.as_ref(), ticket.owner_invoice_id).await?;
        if ledger.has_open_dispute(&ticket) {
            return Err(InvoicingError::TicketUnderDispute(id));
        }
        if ledger.is_superseded(&ticket) {
            return Err(InvoicingError::invalid_state(format!(
                "driver invoice {} was replaced by a dispute resolution",
                id
            )));
        }
        if ticket.is_paid {
            return Ok(ticket);
        }

        pay_ticket(&mut ticket, method, &actor, now);
        let mut changes = ChangeSet::new();
        changes.update(ticket);
        self.store.commit(changes).await?;
        Ok(self.store.get_driver_invoice(id).await?)
    }

    /// Starts a checkout of a job invoice for its billable amount
    ///
    /// Tickets under an open dispute or replaced by a resolution are not
    /// charged; a discount override is capped at the billable total.
    #[instrument(skip(self, payer, now))]
    pub async fn pay_job_invoice(
        &self,
        id: JobInvoiceId,
        channel: PaymentChannel,
        payer: Payer,
        now: DateTime<Utc>,
    ) -> Result<PaymentIntent, InvoicingError> {
        let mut invoice = self.store.get_job_invoice(id).await?;
        ensure_checkout_allowed(&invoice)?;

        let ledger = TicketLedger::for_job_invoice(self.store.as_ref(), id).await?;
        let billable = ledger.billable_total(invoice.amount.currency())?;
        let amount = match invoice.has_discount {
            Some(discount) if discount.amount() < billable.amount() => discount,
            _ => billable,
        };
        if amount.is_zero() {
            return Err(InvoicingError::invalid_state(format!(
                "{} has nothing left to pay",
                invoice.display_order_number()
            )));
        }

        let intent = self
            .gateway
            .create_payment_intent(amount, &invoice.display_order_number(), &payer, channel)
            .await?;

        invoice.payment_intent_id = Some(intent.intent_id.clone());
        invoice.customer_id = Some(intent.customer_id.clone());
        invoice.status = InvoiceStatus::Processing;
        invoice.events_history.push(
            checkout_event(
                InvoiceEventKind::PaymentProcessing,
                now,
                &Actor::System,
                serde_json::json!({ "channel": channel, "intentId": intent.intent_id }),
            )
            .with_amount(amount),
        );
        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        Ok(intent)
    }

    /// Charges a late fee; returns the charge id
    #[instrument(skip(self, payer, now))]
    pub async fn pay_late_fee(
        &self,
        id: LateFeeInvoiceId,
        channel: PaymentChannel,
        payer: Payer,
        now: DateTime<Utc>,
    ) -> Result<String, InvoicingError> {
        let mut fee = self.store.get_late_fee(id).await?;
        ensure_checkout_allowed(&fee)?;

        let charge_id = self
            .gateway
            .create_charge(fee.amount, &fee.order_number, &payer, channel)
            .await?;

        fee.charge_id = Some(charge_id.clone());
        fee.status = InvoiceStatus::Processing;
        fee.events_history.push(
            checkout_event(
                InvoiceEventKind::PaymentProcessing,
                now,
                &Actor::System,
                serde_json::json!({ "channel": channel, "chargeId": charge_id }),
            )
            .with_amount(fee.amount),
        );
        let mut changes = ChangeSet::new();
        changes.update(fee);
        self.store.commit(changes).await?;
        Ok(charge_id)
    }

    async fn load_target(&self, target: PaymentTarget) -> Result<PayableRecord, InvoicingError> {
        Ok(match target {
            PaymentTarget::JobInvoice(id) => PayableRecord::Job(self.store.get_job_invoice(id).await?),
            PaymentTarget::LateFee(id) => PayableRecord::LateFee(self.store.get_late_fee(id).await?),
        })
    }

    /// Records a claim that an invoice was paid off-platform
    ///
    /// Only one claim per invoice can await review at a time.
    #[instrument(skip(self, request, now), fields(target = %request.target))]
    pub async fn submit_manual_payment(
        &self,
        request: ManualPaymentRequest,
        submitted_by: Actor,
        now: DateTime<Utc>,
    ) -> Result<ManualPayment, InvoicingError> {
        let mut record = self.load_target(request.target).await?;
        let invoice = record.payable_mut();
        let order_number = invoice.display_order_number();
        if invoice.is_paid() {
            return Err(InvoicingError::InvoiceAlreadyPaid(order_number));
        }
        let pending = self.store.manual_payments_for(request.target).await?;
        if pending.iter().any(ManualPayment::is_awaiting_review) {
            return Err(InvoicingError::ManualPaymentAlreadySubmitted(order_number));
        }
        if !invoice.status().can_transition_to(InvoiceStatus::Pending) {
            return Err(InvoicingError::invalid_state(format!(
                "{} cannot take a manual payment while {}",
                order_number,
                invoice.status()
            )));
        }

        invoice.set_status(InvoiceStatus::Pending);
        invoice.history_mut().push(checkout_event(
            InvoiceEventKind::PaymentPending,
            now,
            &submitted_by,
            serde_json::json!({ "accountNumber": request.account_number }),
        ));

        let payment = ManualPayment {
            id: ManualPaymentId::new_v7(),
            target: request.target,
            order_number,
            account_number: request.account_number,
            attachments: request.attachments,
            submitted_by: submitted_by.to_string(),
            submitted_at: now,
            approved_at: None,
            rejected: false,
            rejected_at: None,
            reject_reason: None,
            version: 0,
        };

        let mut changes = ChangeSet::new();
        changes.insert(payment.clone()).update(record);
        self.store.commit(changes).await?;
        info!(manual_payment_id = %payment.id, "Manual payment submitted");
        Ok(payment)
    }

    /// Approves a manual payment claim and marks its invoice paid
    #[instrument(skip(self, actor, now))]
    pub async fn confirm_manual_payment(
        &self,
        id: ManualPaymentId,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<ManualPayment, InvoicingError> {
        let mut payment = self.store.get_manual_payment(id).await?;
        if !payment.is_awaiting_review() {
            return Err(InvoicingError::ManualPaymentAlreadyReviewed(id));
        }
        let mut record = self.load_target(payment.target).await?;
        if !record.payable_mut().mark_paid(PaymentMethod::Manual, &actor, now)? {
            return Err(InvoicingError::InvoiceAlreadyPaid(payment.order_number.clone()));
        }
        payment.approved_at = Some(now);

        let mut changes = ChangeSet::new();
        changes.update(payment).update(record);
        self.store.commit(changes).await?;
        info!("Manual payment confirmed");
        Ok(self.store.get_manual_payment(id).await?)
    }

    /// Rejects a manual payment claim; the claim is kept with its reason
    #[instrument(skip(self, reason, actor, now))]
    pub async fn reject_manual_payment(
        &self,
        id: ManualPaymentId,
        reason: String,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<ManualPayment, InvoicingError> {
        let mut payment = self.store.get_manual_payment(id).await?;
        if !payment.is_awaiting_review() {
            return Err(InvoicingError::ManualPaymentAlreadyReviewed(id));
        }
        let mut record = self.load_target(payment.target).await?;
        let invoice = record.payable_mut();
        if invoice.is_paid() {
            return Err(InvoicingError::InvoiceAlreadyPaid(payment.order_number.clone()));
        }
        invoice.set_status(InvoiceStatus::Rejected);
        invoice.history_mut().push(checkout_event(
            InvoiceEventKind::PaymentRejected,
            now,
            &actor,
            serde_json::json!({ "reason": reason }),
        ));

        payment.rejected = true;
        payment.rejected_at = Some(now);
        payment.reject_reason = Some(reason);

        let mut changes = ChangeSet::new();
        changes.update(payment).update(record);
        self.store.commit(changes).await?;
        info!("Manual payment rejected");
        Ok(self.store.get_manual_payment(id).await?)
    }

    /// Applies a discount override, or removes the one in place
    #[instrument(skip(self, value, actor, now))]
    pub async fn toggle_discount(
        &self,
        id: JobInvoiceId,
        value: Money,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<JobInvoice, InvoicingError> {
        let mut invoice = self.store.get_job_invoice(id).await?;
        if invoice.is_paid {
            return Err(InvoicingError::InvoiceAlreadyPaid(invoice.display_order_number()));
        }

        match invoice.has_discount.take() {
            Some(previous) => {
                invoice.events_history.push(
                    InvoiceEvent::new(InvoiceEventKind::DiscountRemoved, now)
                        .with_amount(previous)
                        .by(&actor),
                );
            }
            None => {
                if value.currency() != invoice.amount.currency()
                    || value.amount().is_sign_negative()
                    || value.amount() > invoice.amount.amount()
                {
                    return Err(InvoicingError::invalid_state(format!(
                        "discounted amount {} must lie between zero and {}",
                        value, invoice.amount
                    )));
                }
                invoice.has_discount = Some(value.round_to_currency());
                invoice.events_history.push(
                    InvoiceEvent::new(InvoiceEventKind::DiscountApplied, now)
                        .with_amount(value)
                        .by(&actor),
                );
            }
        }

        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;
        Ok(self.store.get_job_invoice(id).await?)
    }
}

fn ensure_checkout_allowed(invoice: &dyn Payable) -> Result<(), InvoicingError> {
    if invoice.is_paid() {
        return Err(InvoicingError::InvoiceAlreadyPaid(invoice.display_order_number()));
    }
    if !invoice.status().can_transition_to(InvoiceStatus::Processing) {
        return Err(InvoicingError::invalid_state(format!(
            "{} cannot start a checkout while {}",
            invoice.display_order_number(),
            invoice.status()
        )));
    }
    Ok(())
}

fn pay_ticket(ticket: &mut DriverJobInvoice, method: PaymentMethod, actor: &Actor, now: DateTime<Utc>) {
    ticket.is_paid = true;
    ticket.paid_at = Some(now);
    ticket.paid_with = Some(method.as_str().to_string());
    ticket.events_history.push(
        InvoiceEvent::new(InvoiceEventKind::Paid, now)
            .with_amount(ticket.amount)
            .by(actor)
            .with_data(serde_json::json!({ "method": method.as_str() })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use crate::ports::mock::GatewayCall;
    use crate::ports::GatewayError;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_intent_paid_is_idempotent() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;
        let reconciler = harness.reconciler();

        let intent = reconciler
            .pay_job_invoice(invoice.id, PaymentChannel::Bank, harness.payer(), fixtures::now())
            .await
            .unwrap();
        assert_eq!(harness.job_invoice().await.status, InvoiceStatus::Processing);

        let first = reconciler.intent_paid(&intent.intent_id, fixtures::now()).await.unwrap();
        let second = reconciler.intent_paid(&intent.intent_id, fixtures::now()).await.unwrap();
        assert_eq!(first, ReconcileOutcome::Applied);
        assert_eq!(second, ReconcileOutcome::Duplicate);

        let paid = harness.job_invoice().await;
        assert!(paid.is_paid);
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.events_history.count_of(InvoiceEventKind::Paid), 1);
        assert_eq!(paid.events_history.last().unwrap().data["method"], "bank");
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_reported() {
        let harness = Harness::generated_simple_hourly_job().await;
        let err = harness.reconciler().transfer_paid("tr_missing", fixtures::now()).await.unwrap_err();
        assert!(matches!(err, InvoicingError::CorrelationNotFound { kind: "transfer", .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_checkout_uses_discount_and_classifies_gateway_errors() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;
        let reconciler = harness.reconciler();
        let discount = Money::new(dec!(150), invoice.amount.currency());

        reconciler
            .toggle_discount(invoice.id, discount, Actor::System, fixtures::now())
            .await
            .unwrap();

        harness
            .payments
            .fail_next(GatewayError::BalanceInsufficient("insufficient funds".into()))
            .await;
        let err = reconciler
            .pay_job_invoice(invoice.id, PaymentChannel::Card, harness.payer(), fixtures::now())
            .await
            .unwrap_err();
        assert!(matches!(err, InvoicingError::StripeBalanceInsufficient(_)));
        assert_eq!(harness.job_invoice().await.status, InvoiceStatus::Created);

        reconciler
            .pay_job_invoice(invoice.id, PaymentChannel::Card, harness.payer(), fixtures::now())
            .await
            .unwrap();
        let charged: Vec<Money> = harness
            .payments
            .calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::PaymentIntent { amount, .. } => Some(amount),
                _ => None,
            })
            .collect();
        assert_eq!(charged.last(), Some(&discount));
    }

    #[tokio::test]
    async fn test_discount_toggles_instead_of_stacking() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;
        let reconciler = harness.reconciler();
        let value = Money::new(dec!(180), invoice.amount.currency());

        let on = reconciler.toggle_discount(invoice.id, value, Actor::System, fixtures::now()).await.unwrap();
        assert_eq!(on.payable_amount(), value);

        let off = reconciler.toggle_discount(invoice.id, value, Actor::System, fixtures::now()).await.unwrap();
        assert_eq!(off.has_discount, None);
        assert_eq!(off.payable_amount(), invoice.amount);
    }

    #[tokio::test]
    async fn test_manual_payment_reject_then_confirm() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;
        let reconciler = harness.reconciler();
        let request = ManualPaymentRequest {
            target: PaymentTarget::JobInvoice(invoice.id),
            account_number: "000123456789".to_string(),
            attachments: vec!["wire-confirmation.pdf".to_string()],
        };

        let first = reconciler
            .submit_manual_payment(request.clone(), harness.contractor_actor(), fixtures::now())
            .await
            .unwrap();
        assert_eq!(harness.job_invoice().await.status, InvoiceStatus::Pending);

        let duplicate = reconciler
            .submit_manual_payment(request.clone(), harness.contractor_actor(), fixtures::now())
            .await;
        assert!(matches!(duplicate, Err(InvoicingError::ManualPaymentAlreadySubmitted(_))));

        let rejected = reconciler
            .reject_manual_payment(first.id, "Wire not received".to_string(), Actor::System, fixtures::now())
            .await
            .unwrap();
        assert!(rejected.rejected);
        assert_eq!(rejected.reject_reason.as_deref(), Some("Wire not received"));
        assert_eq!(harness.job_invoice().await.status, InvoiceStatus::Rejected);

        let second = reconciler
            .submit_manual_payment(request, harness.contractor_actor(), fixtures::now())
            .await
            .unwrap();
        let confirmed = reconciler
            .confirm_manual_payment(second.id, Actor::System, fixtures::now())
            .await
            .unwrap();
        assert!(confirmed.approved_at.is_some());

        let paid = harness.job_invoice().await;
        assert!(paid.is_paid);
        assert_eq!(harness.store.manual_payments_for(PaymentTarget::JobInvoice(invoice.id)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_late_fee_charge_pending_then_paid() {
        let harness = Harness::generated_simple_hourly_job().await;
        let fee = harness.charge_late_fee().await;
        let reconciler = harness.reconciler();

        let charge_id = reconciler
            .pay_late_fee(fee.id, PaymentChannel::Card, harness.payer(), fixtures::now())
            .await
            .unwrap();
        assert_eq!(
            reconciler.charge_pending(&charge_id, fixtures::now()).await.unwrap(),
            ReconcileOutcome::Duplicate
        );
        reconciler.charge_paid(&charge_id, fixtures::now() + Duration::hours(2)).await.unwrap();

        let stored = harness.store.get_late_fee(fee.id).await.unwrap();
        assert!(stored.is_paid);
        assert_eq!(stored.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_transfer_paid_skips_disputed_ticket() {
        let harness = Harness::generated_two_owner_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        let tickets = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(tickets[0].id, &harness), fixtures::now())
            .await
            .unwrap();

        let transfer_id = harness.payouts().transfer_to_owner(owner.id, fixtures::now()).await.unwrap();
        harness.reconciler().transfer_paid(&transfer_id, fixtures::now()).await.unwrap();

        let after = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        assert!(!after[0].is_paid);
        assert!(after[1].is_paid);
        assert_eq!(after[1].paid_with.as_deref(), Some("transfer"));
        assert!(harness.store.get_owner_invoice(owner.id).await.unwrap().is_paid);
    }

    #[tokio::test]
    async fn test_disputed_ticket_cannot_be_paid_directly() {
        let harness = Harness::generated_two_owner_job().await;
        let ticket = harness.tickets().await.remove(0);
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(ticket.id, &harness), fixtures::now())
            .await
            .unwrap();

        let result = harness
            .reconciler()
            .mark_driver_invoice_paid(ticket.id, PaymentMethod::Cash, Actor::System, fixtures::now())
            .await;
        assert!(matches!(result, Err(InvoicingError::TicketUnderDispute(_))));
    }

    #[tokio::test]
    async fn test_checkout_leaves_out_disputed_ticket() {
        let harness = Harness::generated_two_owner_job().await;
        let invoice = harness.job_invoice().await;
        let ticket = harness.tickets().await.remove(0);
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(ticket.id, &harness), fixtures::now())
            .await
            .unwrap();

        harness
            .reconciler()
            .pay_job_invoice(invoice.id, PaymentChannel::Card, harness.payer(), fixtures::now())
            .await
            .unwrap();
        let charged = harness.payments.calls().await.into_iter().find_map(|c| match c {
            GatewayCall::PaymentIntent { amount, .. } => Some(amount),
            _ => None,
        });
        assert_eq!(charged.map(|m| m.amount()), Some(dec!(690.00)));
    }

    #[tokio::test]
    async fn test_superseded_ticket_is_never_settled() {
        let harness = Harness::generated_two_owner_job().await;
        let owner = harness.owner_invoices().await.remove(0);
        let tickets = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        let report = harness.dispute_and_uphold(tickets[0].id).await;

        let transfer_id = harness.payouts().transfer_to_owner(owner.id, fixtures::now()).await.unwrap();
        harness.reconciler().transfer_paid(&transfer_id, fixtures::now()).await.unwrap();

        let after = harness.store.driver_invoices_for_owner_invoice(owner.id).await.unwrap();
        assert!(!after[0].is_paid);
        assert!(after[1].is_paid);
        assert!(!harness.store.get_driver_invoice(report.driver_invoice_id).await.unwrap().is_paid);

        let direct = harness
            .reconciler()
            .mark_driver_invoice_paid(tickets[0].id, PaymentMethod::Cash, Actor::System, fixtures::now())
            .await;
        assert!(matches!(direct, Err(InvoicingError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_late_intent_on_canceled_invoice_is_refused() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;
        let intent = harness
            .reconciler()
            .pay_job_invoice(invoice.id, PaymentChannel::Card, harness.payer(), fixtures::now())
            .await
            .unwrap();

        let mut canceled = harness.job_invoice().await;
        canceled.status = InvoiceStatus::Canceled;
        let mut changes = ChangeSet::new();
        changes.update(canceled);
        harness.store.commit(changes).await.unwrap();

        let result = harness.reconciler().intent_paid(&intent.intent_id, fixtures::now()).await;
        assert!(matches!(result, Err(InvoicingError::InvalidState(_))));
        let stored = harness.job_invoice().await;
        assert!(!stored.is_paid);
        assert_eq!(stored.status, InvoiceStatus::Canceled);
    }

    #[tokio::test]
    async fn test_fully_disputed_invoice_has_nothing_to_check_out() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;
        let ticket = harness.tickets().await.remove(0);
        harness
            .disputes()
            .create_dispute_driver(fixtures::dispute_request(ticket.id, &harness), fixtures::now())
            .await
            .unwrap();

        let result = harness
            .reconciler()
            .pay_job_invoice(invoice.id, PaymentChannel::Card, harness.payer(), fixtures::now())
            .await;
        assert!(matches!(result, Err(InvoicingError::InvalidState(_))));
        assert!(harness.payments.calls().await.iter().all(|c| !matches!(c, GatewayCall::PaymentIntent { .. })));
    }
}
