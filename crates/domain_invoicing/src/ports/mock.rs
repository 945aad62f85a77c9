//! In-memory implementations of the invoicing ports
//!
//! Used by unit tests here and by the scenario tests in `test_utils`. The
//! store enforces the same version rules as the PostgreSQL adapter, so
//! concurrency tests exercise real conflict behaviour.

use super::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Barrier, Mutex, RwLock};

use core_kernel::{DisputeId, ManualPaymentId};

use crate::dispute::DisputeInvoice;
use crate::invoice::CashAdvanceState;
use crate::notifications::{Channel, Topic};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    job_invoices: HashMap<JobInvoiceId, JobInvoice>,
    owner_invoices: HashMap<OwnerInvoiceId, OwnerJobInvoice>,
    driver_invoices: HashMap<DriverInvoiceId, DriverJobInvoice>,
    disputes: HashMap<DisputeId, DisputeInvoice>,
    late_fees: HashMap<LateFeeInvoiceId, LateFeeInvoice>,
    manual_payments: HashMap<ManualPaymentId, ManualPayment>,
    dispute_sequence: u64,
}

impl State {
    fn current_version(&self, record: &Record) -> Option<u64> {
        match record {
            Record::Job(r) => self.jobs.get(&r.id).map(|x| x.version),
            Record::JobInvoice(r) => self.job_invoices.get(&r.id).map(|x| x.version),
            Record::OwnerInvoice(r) => self.owner_invoices.get(&r.id).map(|x| x.version),
            Record::DriverInvoice(r) => self.driver_invoices.get(&r.id).map(|x| x.version),
            Record::Dispute(r) => self.disputes.get(&r.id).map(|x| x.version),
            Record::LateFee(r) => self.late_fees.get(&r.id).map(|x| x.version),
            Record::ManualPayment(r) => self.manual_payments.get(&r.id).map(|x| x.version),
        }
    }

    fn put(&mut self, record: Record) {
        match record {
            Record::Job(r) => {
                self.jobs.insert(r.id, r);
            }
            Record::JobInvoice(r) => {
                self.job_invoices.insert(r.id, r);
            }
            Record::OwnerInvoice(r) => {
                self.owner_invoices.insert(r.id, r);
            }
            Record::DriverInvoice(r) => {
                self.driver_invoices.insert(r.id, r);
            }
            Record::Dispute(r) => {
                self.disputes.insert(r.id, r);
            }
            Record::LateFee(r) => {
                self.late_fees.insert(r.id, r);
            }
            Record::ManualPayment(r) => {
                self.manual_payments.insert(r.id, r);
            }
        }
    }
}

/// Commits parked until every racing party has read its records
#[derive(Debug)]
struct CommitGate {
    barrier: Arc<Barrier>,
    remaining: usize,
}

/// In-memory invoice store with version-checked commits
#[derive(Debug, Default, Clone)]
pub struct InMemoryInvoiceStore {
    state: Arc<RwLock<State>>,
    gate: Arc<Mutex<Option<CommitGate>>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the next `parties` commits until all of them have arrived
    ///
    /// Each racing operation does its reads and then blocks in `commit`, so
    /// every party works from the same snapshot and the version check alone
    /// decides the winner. The gate disarms itself after the last party.
    pub async fn hold_commits(&self, parties: usize) {
        *self.gate.lock().await = Some(CommitGate {
            barrier: Arc::new(Barrier::new(parties)),
            remaining: parties,
        });
    }

    async fn pass_gate(&self) {
        let barrier = {
            let mut slot = self.gate.lock().await;
            let Some(gate) = slot.as_mut() else {
                return;
            };
            gate.remaining = gate.remaining.saturating_sub(1);
            let barrier = gate.barrier.clone();
            if gate.remaining == 0 {
                *slot = None;
            }
            barrier
        };
        barrier.wait().await;
    }

    /// Seeds a finished job
    pub async fn insert_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id, job);
    }

    pub async fn driver_invoices_for_job(&self, job_id: JobId) -> Vec<DriverJobInvoice> {
        let state = self.state.read().await;
        let mut tickets: Vec<_> = state
            .driver_invoices
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| (t.curr_dispute, t.ticket_number));
        tickets
    }

    pub async fn dispute_count(&self) -> usize {
        self.state.read().await.disputes.len()
    }
}

impl DomainPort for InMemoryInvoiceStore {}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn get_job(&self, id: JobId) -> Result<Job, PortError> {
        self.state
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Job", id))
    }

    async fn get_job_invoice(&self, id: JobInvoiceId) -> Result<JobInvoice, PortError> {
        self.state
            .read()
            .await
            .job_invoices
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("JobInvoice", id))
    }

    async fn get_owner_invoice(&self, id: OwnerInvoiceId) -> Result<OwnerJobInvoice, PortError> {
        self.state
            .read()
            .await
            .owner_invoices
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("OwnerJobInvoice", id))
    }

    async fn get_driver_invoice(&self, id: DriverInvoiceId) -> Result<DriverJobInvoice, PortError> {
        self.state
            .read()
            .await
            .driver_invoices
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("DriverJobInvoice", id))
    }

    async fn get_dispute(&self, id: DisputeId) -> Result<DisputeInvoice, PortError> {
        self.state
            .read()
            .await
            .disputes
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("DisputeInvoice", id))
    }

    async fn get_late_fee(&self, id: LateFeeInvoiceId) -> Result<LateFeeInvoice, PortError> {
        self.state
            .read()
            .await
            .late_fees
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("LateFeeInvoice", id))
    }

    async fn get_manual_payment(&self, id: ManualPaymentId) -> Result<ManualPayment, PortError> {
        self.state
            .read()
            .await
            .manual_payments
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("ManualPayment", id))
    }

    async fn job_invoices_for_job(&self, job_id: JobId) -> Result<Vec<JobInvoice>, PortError> {
        let state = self.state.read().await;
        let mut invoices: Vec<_> = state
            .job_invoices
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.curr_dispute);
        Ok(invoices)
    }

    async fn owner_invoices_for_job_invoice(
        &self,
        job_invoice_id: JobInvoiceId,
    ) -> Result<Vec<OwnerJobInvoice>, PortError> {
        let state = self.state.read().await;
        let mut invoices: Vec<_> = state
            .owner_invoices
            .values()
            .filter(|i| i.job_invoice_id == job_invoice_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.invoice_number);
        Ok(invoices)
    }

    async fn driver_invoices_for_owner_invoice(
        &self,
        owner_invoice_id: OwnerInvoiceId,
    ) -> Result<Vec<DriverJobInvoice>, PortError> {
        let state = self.state.read().await;
        let mut tickets: Vec<_> = state
            .driver_invoices
            .values()
            .filter(|t| t.owner_invoice_id == owner_invoice_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.ticket_number);
        Ok(tickets)
    }

    async fn latest_job_invoice_by_order(
        &self,
        order_number: &str,
    ) -> Result<Option<JobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .job_invoices
            .values()
            .filter(|i| i.order_number == order_number)
            .max_by_key(|i| i.curr_dispute)
            .cloned())
    }

    async fn latest_owner_invoice_by_order(
        &self,
        owner_order_number: &str,
    ) -> Result<Option<OwnerJobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .owner_invoices
            .values()
            .filter(|i| i.owner_order_number == owner_order_number)
            .max_by_key(|i| i.curr_dispute)
            .cloned())
    }

    async fn late_fees_for_job_invoice(
        &self,
        job_invoice_id: JobInvoiceId,
    ) -> Result<Vec<LateFeeInvoice>, PortError> {
        let state = self.state.read().await;
        let mut fees: Vec<_> = state
            .late_fees
            .values()
            .filter(|f| f.job_invoice_id == job_invoice_id)
            .cloned()
            .collect();
        fees.sort_by_key(|f| f.created_at);
        Ok(fees)
    }

    async fn overdue_job_invoices(&self, now: DateTime<Utc>) -> Result<Vec<JobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .job_invoices
            .values()
            .filter(|i| i.is_open() && i.due_date < now)
            .cloned()
            .collect())
    }

    async fn unpaid_job_invoices_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .job_invoices
            .values()
            .filter(|i| i.is_open() && i.due_date >= from && i.due_date < to)
            .cloned()
            .collect())
    }

    async fn owner_invoices_pending_acceptance(&self) -> Result<Vec<OwnerJobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .owner_invoices
            .values()
            .filter(|i| !i.is_paid && !i.is_fully_accepted())
            .cloned()
            .collect())
    }

    async fn owner_invoices_awaiting_payout(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OwnerJobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .owner_invoices
            .values()
            .filter(|i| !i.is_paid && i.transfer_id.is_none())
            .filter(|i| {
                let advanced = i.cash_advance.state() == CashAdvanceState::Approved;
                let parent_paid = state
                    .job_invoices
                    .get(&i.job_invoice_id)
                    .map(|p| p.is_paid)
                    .unwrap_or(false);
                advanced || (parent_paid && i.due_date <= now)
            })
            .cloned()
            .collect())
    }

    async fn job_invoice_by_payment_intent(&self, intent_id: &str) -> Result<Option<JobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .job_invoices
            .values()
            .find(|i| i.payment_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }

    async fn job_invoice_by_external_invoice(
        &self,
        external_invoice_id: &str,
    ) -> Result<Option<JobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .job_invoices
            .values()
            .find(|i| i.external_invoice_id.as_deref() == Some(external_invoice_id))
            .cloned())
    }

    async fn late_fee_by_charge(&self, charge_id: &str) -> Result<Option<LateFeeInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .late_fees
            .values()
            .find(|f| f.charge_id.as_deref() == Some(charge_id))
            .cloned())
    }

    async fn owner_invoice_by_transfer(&self, transfer_id: &str) -> Result<Option<OwnerJobInvoice>, PortError> {
        let state = self.state.read().await;
        Ok(state
            .owner_invoices
            .values()
            .find(|i| i.transfer_id.as_deref() == Some(transfer_id))
            .cloned())
    }

    async fn manual_payments_for(&self, target: PaymentTarget) -> Result<Vec<ManualPayment>, PortError> {
        let state = self.state.read().await;
        let mut payments: Vec<_> = state
            .manual_payments
            .values()
            .filter(|p| p.target == target)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.submitted_at);
        Ok(payments)
    }

    async fn next_dispute_number(&self) -> Result<u64, PortError> {
        let mut state = self.state.write().await;
        state.dispute_sequence += 1;
        Ok(state.dispute_sequence)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), PortError> {
        self.pass_gate().await;
        let mut state = self.state.write().await;

        for record in changes.inserts() {
            if state.current_version(record).is_some() {
                return Err(PortError::conflict(format!(
                    "{} {} already exists",
                    record.entity_name(),
                    record.id()
                )));
            }
        }
        for record in changes.updates() {
            match state.current_version(record) {
                None => return Err(PortError::not_found(record.entity_name(), record.id())),
                Some(current) if current != record.version() => {
                    return Err(PortError::conflict(format!(
                        "{} {} is at version {}, expected {}",
                        record.entity_name(),
                        record.id(),
                        current,
                        record.version()
                    )));
                }
                Some(_) => {}
            }
        }

        let (inserts, updates) = changes.into_parts();
        for record in inserts {
            state.put(record);
        }
        for record in updates {
            state.put(record.into_next_version());
        }
        Ok(())
    }
}

/// In-memory company and admin directory
#[derive(Debug, Default, Clone)]
pub struct MockPartyDirectory {
    companies: Arc<RwLock<HashMap<CompanyId, Company>>>,
    admins: Arc<RwLock<Vec<Admin>>>,
    admins_unavailable: Arc<AtomicBool>,
}

impl MockPartyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a company
    pub async fn upsert_company(&self, company: Company) {
        self.companies.write().await.insert(company.id, company);
    }

    pub async fn add_admin(&self, admin: Admin) {
        self.admins.write().await.push(admin);
    }

    /// Makes every later `admins` lookup fail
    pub fn fail_admin_lookups(&self) {
        self.admins_unavailable.store(true, Ordering::SeqCst);
    }
}

impl DomainPort for MockPartyDirectory {}

#[async_trait]
impl PartyDirectory for MockPartyDirectory {
    async fn company(&self, id: CompanyId) -> Result<Company, PortError> {
        self.companies
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Company", id))
    }

    async fn admins(&self) -> Result<Vec<Admin>, PortError> {
        if self.admins_unavailable.load(Ordering::SeqCst) {
            return Err(PortError::ServiceUnavailable {
                service: "admin directory".to_string(),
            });
        }
        Ok(self.admins.read().await.clone())
    }
}

/// A call received by [`MockPaymentGateway`]
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    PaymentIntent { amount: Money, reference: String },
    Charge { amount: Money, reference: String },
    Transfer { amount: Money, destination: String, idempotency_key: String },
    Invoice { job_invoice_id: JobInvoiceId },
}

/// Payment gateway double that records calls and can be told to fail
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    calls: RwLock<Vec<GatewayCall>>,
    failures: RwLock<VecDeque<GatewayError>>,
    transfers: RwLock<HashMap<String, String>>,
    sequence: AtomicU64,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next gateway call
    pub async fn fail_next(&self, error: GatewayError) {
        self.failures.write().await.push_back(error);
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.calls.read().await.clone()
    }

    pub async fn transfer_calls(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, GatewayCall::Transfer { .. }))
            .count()
    }

    async fn record(&self, call: GatewayCall) -> Result<String, GatewayError> {
        self.calls.write().await.push(call);
        if let Some(error) = self.failures.write().await.pop_front() {
            return Err(error);
        }
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

impl DomainPort for MockPaymentGateway {}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_payment_intent(
        &self,
        amount: Money,
        reference: &str,
        payer: &Payer,
        _channel: PaymentChannel,
    ) -> Result<PaymentIntent, GatewayError> {
        let n = self
            .record(GatewayCall::PaymentIntent { amount, reference: reference.to_string() })
            .await?;
        Ok(PaymentIntent {
            intent_id: format!("pi_{}", n),
            customer_id: payer.customer_id.clone().unwrap_or_else(|| format!("cus_{}", n)),
        })
    }

    async fn create_charge(
        &self,
        amount: Money,
        reference: &str,
        _payer: &Payer,
        _channel: PaymentChannel,
    ) -> Result<String, GatewayError> {
        let n = self
            .record(GatewayCall::Charge { amount, reference: reference.to_string() })
            .await?;
        Ok(format!("ch_{}", n))
    }

    async fn create_transfer(
        &self,
        amount: Money,
        destination: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        if let Some(existing) = self.transfers.read().await.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let n = self
            .record(GatewayCall::Transfer {
                amount,
                destination: destination.to_string(),
                idempotency_key: idempotency_key.to_string(),
            })
            .await?;
        let transfer_id = format!("tr_{}", n);
        self.transfers
            .write()
            .await
            .insert(idempotency_key.to_string(), transfer_id.clone());
        Ok(transfer_id)
    }

    async fn create_invoice(&self, invoice: &JobInvoice) -> Result<String, GatewayError> {
        let n = self
            .record(GatewayCall::Invoice { job_invoice_id: invoice.id })
            .await?;
        Ok(format!("in_{}", n))
    }
}

/// Notification gateway that keeps every delivered notification
#[derive(Debug, Default)]
pub struct RecordingNotificationGateway {
    delivered: RwLock<Vec<Notification>>,
    failing: RwLock<HashSet<Channel>>,
}

impl RecordingNotificationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delivery on `channel` fail
    pub async fn fail_channel(&self, channel: Channel) {
        self.failing.write().await.insert(channel);
    }

    pub async fn delivered(&self) -> Vec<Notification> {
        self.delivered.read().await.clone()
    }

    pub async fn delivered_for(&self, topic: Topic) -> Vec<Notification> {
        self.delivered
            .read()
            .await
            .iter()
            .filter(|n| n.topic == topic)
            .cloned()
            .collect()
    }
}

impl DomainPort for RecordingNotificationGateway {}

#[async_trait]
impl NotificationGateway for RecordingNotificationGateway {
    async fn deliver(&self, notification: &Notification) -> Result<(), PortError> {
        if self.failing.read().await.contains(&notification.channel) {
            return Err(PortError::ServiceUnavailable {
                service: format!("{:?} delivery", notification.channel),
            });
        }
        self.delivered.write().await.push(notification.clone());
        Ok(())
    }
}
