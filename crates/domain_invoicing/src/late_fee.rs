//! Late-fee recharges and due-date reminders
//!
//! An overdue job invoice is recharged at most once per cooldown window and
//! at most 26 times; recharges are lettered `-A` through `-Z`. The base is
//! the billable total of the invoice's [`TicketLedger`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use core_kernel::{JobInvoiceId, LateFeeInvoiceId, Money};

use crate::error::InvoicingError;
use crate::invoice::{
    Actor, EventsHistory, InvoiceEvent, InvoiceEventKind, InvoiceStatus, JobInvoice, Payable,
};
use crate::ledger::TicketLedger;
use crate::notifications::{plan_business_hours_alert, plan_company, Channel, NotificationDispatcher, Topic};
use crate::policy::BillingPolicy;
use crate::ports::{ChangeSet, InvoiceStore, PartyDirectory};
use crate::sweep::SweepReport;

/// A recharge invoice raised against an overdue job invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFeeInvoice {
    pub id: LateFeeInvoiceId,
    pub job_invoice_id: JobInvoiceId,
    /// `{parent}-{letter}`
    pub order_number: String,
    pub amount: Money,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: InvoiceStatus,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub charge_id: Option<String>,
    pub events_history: EventsHistory,
    pub version: u64,
}

impl Payable for LateFeeInvoice {
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
        self.amount
    }

    fn history_mut(&mut self) -> &mut EventsHistory {
        &mut self.events_history
    }

    fn display_order_number(&self) -> String {
        self.order_number.clone()
    }
}

/// Suffix letter of the n-th late fee (0-based); `None` past `Z`
pub fn late_fee_letter(existing: usize) -> Option<char> {
    u8::try_from(existing)
        .ok()
        .filter(|n| *n < 26)
        .map(|n| char::from(b'A' + n))
}

/// Periodic late-fee and reminder scans over job invoices
pub struct LateFeeScheduler {
    store: Arc<dyn InvoiceStore>,
    directory: Arc<dyn PartyDirectory>,
    dispatcher: NotificationDispatcher,
    policy: BillingPolicy,
}

impl LateFeeScheduler {
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

    /// Charges late fees on every overdue job invoice that is eligible now
    #[instrument(skip_all)]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, InvoicingError> {
        let overdue = self.store.overdue_job_invoices(now).await?;
        let mut report = SweepReport::default();

        for invoice in overdue {
            report.examined += 1;
            let id = invoice.id;
            match self.charge(invoice, now).await {
                Ok(Some(fee)) => {
                    report.changed += 1;
                    info!(job_invoice_id = %id, late_fee = %fee.order_number, amount = %fee.amount, "Late fee charged");
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(job_invoice_id = %id, error = %e, "Late fee charge failed");
                }
            }
        }

        info!(
            examined = report.examined,
            charged = report.changed,
            failed = report.failed,
            "Late fee sweep finished"
        );
        Ok(report)
    }

    async fn charge(&self, mut invoice: JobInvoice, now: DateTime<Utc>) -> Result<Option<LateFeeInvoice>, InvoicingError> {
        let existing = self.store.late_fees_for_job_invoice(invoice.id).await?;
        if existing.len() >= self.policy.late_fee_cap as usize {
            return Ok(None);
        }
        if let Some(last) = existing.last() {
            if now - last.created_at < self.policy.late_fee_cooldown() {
                return Ok(None);
            }
        }
        let Some(letter) = late_fee_letter(existing.len()) else {
            return Ok(None);
        };

        let base = self.chargeable_base(&invoice).await?;
        if base.is_zero() {
            return Ok(None);
        }

        let amount = self.policy.late_fee.apply(&base).round_to_currency();
        let order_number = format!("{}-{}", invoice.display_order_number(), letter);
        let mut events_history = EventsHistory::new();
        events_history.push(InvoiceEvent::new(InvoiceEventKind::Created, now).with_amount(amount));

        let fee = LateFeeInvoice {
            id: LateFeeInvoiceId::new_v7(),
            job_invoice_id: invoice.id,
            order_number,
            amount,
            due_date: now + Duration::days(self.policy.late_fee_due_days),
            created_at: now,
            status: InvoiceStatus::Created,
            is_paid: false,
            paid_at: None,
            charge_id: None,
            events_history,
            version: 0,
        };

        invoice.events_history.push(
            InvoiceEvent::new(InvoiceEventKind::LateFeeCharged, now)
                .with_amount(amount)
                .by(&Actor::System)
                .with_data(serde_json::json!({ "orderNumber": fee.order_number })),
        );

        let data = serde_json::json!({
            "orderNumber": invoice.display_order_number(),
            "lateFeeOrderNumber": fee.order_number,
            "lateFee": amount,
            "newTotal": self.policy.late_fee.compound(&invoice.amount).round_to_currency(),
            "dueDate": fee.due_date,
        });
        let contractor = self.directory.company(invoice.contractor_id).await?;

        let mut changes = ChangeSet::new();
        changes.insert(fee.clone()).update(invoice);
        self.store.commit(changes).await?;

        self.dispatcher
            .dispatch(plan_business_hours_alert(
                &contractor,
                &self.policy.business_hours,
                now,
                Topic::LateFeeCharged,
                data,
            ))
            .await;

        Ok(Some(fee))
    }

    async fn chargeable_base(&self, invoice: &JobInvoice) -> Result<Money, InvoicingError> {
        let ledger = TicketLedger::for_job_invoice(self.store.as_ref(), invoice.id).await?;
        Ok(ledger.billable_total(invoice.amount.currency())?)
    }

    /// Reminds contractors of invoices due a fixed number of local days ahead
    ///
    /// Each invoice gets one reminder; the `DUE_REMINDER` event marks it.
    #[instrument(skip_all)]
    pub async fn send_due_reminders(&self, now: DateTime<Utc>) -> Result<SweepReport, InvoicingError> {
        let days_ahead = self.policy.reminder_days_ahead;
        // Padded by a day each side so every timezone's local day is covered
        let from = now + Duration::days(days_ahead - 1);
        let to = now + Duration::days(days_ahead + 2);
        let candidates = self.store.unpaid_job_invoices_due_between(from, to).await?;
        let mut report = SweepReport::default();

        for invoice in candidates {
            report.examined += 1;
            let id = invoice.id;
            match self.remind(invoice, now).await {
                Ok(true) => report.changed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(job_invoice_id = %id, error = %e, "Due reminder failed");
                }
            }
        }

        info!(examined = report.examined, reminded = report.changed, "Due reminder sweep finished");
        Ok(report)
    }

    async fn remind(&self, mut invoice: JobInvoice, now: DateTime<Utc>) -> Result<bool, InvoicingError> {
        if invoice.events_history.count_of(InvoiceEventKind::DueReminder) > 0 {
            return Ok(false);
        }

        let contractor = self.directory.company(invoice.contractor_id).await?;
        let days = contractor.contact.timezone.calendar_days_between(now, invoice.due_date);
        if days != self.policy.reminder_days_ahead {
            return Ok(false);
        }

        let data = serde_json::json!({
            "orderNumber": invoice.display_order_number(),
            "amount": invoice.payable_amount(),
            "dueDate": invoice.due_date,
        });
        invoice
            .events_history
            .push(InvoiceEvent::new(InvoiceEventKind::DueReminder, now).by(&Actor::System));

        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await?;

        self.dispatcher
            .dispatch(plan_company(&contractor, &[Channel::Email, Channel::Push], Topic::DueReminder, data))
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use rust_decimal_macros::dec;

    #[test]
    fn test_letters_run_a_to_z() {
        assert_eq!(late_fee_letter(0), Some('A'));
        assert_eq!(late_fee_letter(25), Some('Z'));
        assert_eq!(late_fee_letter(26), None);
        assert_eq!(late_fee_letter(300), None);
    }

    #[tokio::test]
    async fn test_fee_is_four_percent_and_lettered() {
        let harness = Harness::generated_simple_hourly_job().await;
        let invoice = harness.job_invoice().await;

        let report = harness.late_fees().run(invoice.due_date + Duration::hours(1)).await.unwrap();
        assert_eq!(report.changed, 1);

        let fees = harness.store.late_fees_for_job_invoice(invoice.id).await.unwrap();
        assert_eq!(fees[0].amount.amount(), dec!(8.00));
        assert_eq!(fees[0].order_number, format!("{}-A", invoice.order_number));
        assert_eq!(fees[0].due_date, invoice.due_date + Duration::hours(1) + Duration::days(7));

        let parent = harness.job_invoice().await;
        assert_eq!(parent.events_history.count_of(InvoiceEventKind::LateFeeCharged), 1);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_fee_within_a_day() {
        let harness = Harness::generated_simple_hourly_job().await;
        let scheduler = harness.late_fees();
        let due = harness.job_invoice().await.due_date;

        scheduler.run(due + Duration::hours(1)).await.unwrap();
        let blocked = scheduler.run(due + Duration::hours(20)).await.unwrap();
        assert_eq!(blocked.changed, 0);

        let next = scheduler.run(due + Duration::hours(26)).await.unwrap();
        assert_eq!(next.changed, 1);
        let fees = harness.store.late_fees_for_job_invoice(harness.job_invoice().await.id).await.unwrap();
        assert!(fees[1].order_number.ends_with("-B"));
    }

    #[tokio::test]
    async fn test_fees_stop_at_cap() {
        let harness = Harness::generated_simple_hourly_job().await;
        let scheduler = harness.late_fees();
        let due = harness.job_invoice().await.due_date;

        for day in 1..=30 {
            scheduler.run(due + Duration::days(day)).await.unwrap();
        }

        let fees = harness.store.late_fees_for_job_invoice(harness.job_invoice().await.id).await.unwrap();
        assert_eq!(fees.len(), 26);
        assert!(fees[25].order_number.ends_with("-Z"));
    }

    #[tokio::test]
    async fn test_sms_only_inside_business_hours() {
        let harness = Harness::generated_simple_hourly_job().await;
        let due = harness.job_invoice().await.due_date;
        // Contractor is in America/Chicago; 14:00 UTC is 09:00 local in May
        let in_hours = fixtures::at_utc_hour(due + Duration::days(1), 14);
        harness.late_fees().run(in_hours).await.unwrap();

        let channels: Vec<Channel> = harness
            .notifications
            .delivered_for(Topic::LateFeeCharged)
            .await
            .iter()
            .map(|n| n.channel)
            .collect();
        assert!(channels.contains(&Channel::Sms));
        assert!(channels.contains(&Channel::Email));

        let after_hours = fixtures::at_utc_hour(due + Duration::days(3), 3);
        harness.late_fees().run(after_hours).await.unwrap();
        let sms = harness
            .notifications
            .delivered_for(Topic::LateFeeCharged)
            .await
            .iter()
            .filter(|n| n.channel == Channel::Sms)
            .count();
        assert_eq!(sms, 1);
    }

    #[tokio::test]
    async fn test_due_reminder_sent_once() {
        let harness = Harness::generated_simple_hourly_job().await;
        let due = harness.job_invoice().await.due_date;
        let scheduler = harness.late_fees();

        let first = scheduler.send_due_reminders(due - Duration::days(2)).await.unwrap();
        assert_eq!(first.changed, 1);
        let second = scheduler.send_due_reminders(due - Duration::days(2) + Duration::hours(1)).await.unwrap();
        assert_eq!(second.changed, 0);
        assert_eq!(harness.notifications.delivered_for(Topic::DueReminder).await.len(), 2);
    }

    #[tokio::test]
    async fn test_fee_follows_ticket_into_next_level() {
        let harness = Harness::generated_two_owner_job().await;
        let prior = harness.job_invoice().await;
        let ticket = harness.tickets().await.remove(0);
        let report = harness.dispute_and_uphold(ticket.id).await;
        let next = harness.store.get_job_invoice(report.job_invoice_id).await.unwrap();

        harness.late_fees().run(prior.due_date + Duration::hours(1)).await.unwrap();
        let prior_fees = harness.store.late_fees_for_job_invoice(prior.id).await.unwrap();
        // 4% of the 690 still billed on the prior level
        assert_eq!(prior_fees[0].amount.amount(), dec!(27.60));

        harness.late_fees().run(next.due_date + Duration::hours(1)).await.unwrap();
        let next_fees = harness.store.late_fees_for_job_invoice(next.id).await.unwrap();
        assert_eq!(next_fees[0].amount.amount(), dec!(8.00));
    }
}
