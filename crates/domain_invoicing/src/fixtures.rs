//! Canned jobs, companies and a wired in-memory harness
//!
//! Shared by the unit tests of this crate and, through the `mock` feature,
//! by `test_utils`.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use core_kernel::{
    AssignmentId, CompanyId, Currency, DisputeId, DriverInvoiceId, JobId, JobInvoiceId, Money,
    OwnerInvoiceId, Timezone, UserId,
};

use crate::acceptance::AcceptanceTracker;
use crate::cash_advance::CashAdvanceWorkflow;
use crate::dispute::{
    DisputeInvoice, DisputeOutcome, DisputeResolution, DisputeResolutionEngine, DisputeStatus,
    OpenDisputeRequest, RequesterRole, ResolutionReport,
};
use crate::engine::{EnginePorts, InvoicingEngine};
use crate::generator::InvoiceGenerator;
use crate::invoice::{
    AcceptingParty, Actor, DriverJobInvoice, EventsHistory, InvoiceStatus, JobInvoice,
    OwnerJobInvoice, Payable, PaymentMethod,
};
use crate::job::{Assignment, Job, LoadEvent, LoadEventKind, ScheduledJob, TimeEntry};
use crate::late_fee::{LateFeeInvoice, LateFeeScheduler};
use crate::party::{Admin, Company, Contact};
use crate::payout::PayoutService;
use crate::policy::BillingPolicy;
use crate::ports::mock::{
    InMemoryInvoiceStore, MockPartyDirectory, MockPaymentGateway, RecordingNotificationGateway,
};
use crate::ports::{ChangeSet, InvoiceStore, Payer};
use crate::pricing::{calculate_amount, CommodityKind, Quantities};
use crate::reconciliation::PaymentReconciler;

/// Fixed clock: Monday 2024-05-06 14:00 UTC
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap()
}

/// Same UTC day as `at`, at `hour`:00
pub fn at_utc_hour(at: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    at.with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .unwrap()
}

fn usd(amount: Decimal) -> Money {
    Money::new(amount, Currency::USD)
}

pub fn contractor() -> Company {
    Company {
        id: CompanyId::new_v7(),
        name: "Ridgeline Paving".to_string(),
        short_id: Some("RDG".to_string()),
        user_id: UserId::new_v7(),
        associated_user_id: None,
        payout_account: None,
        contact: Contact {
            phone: Some("+13125550101".to_string()),
            email: Some("billing@ridgeline.example".to_string()),
            timezone: Timezone::from_str("America/Chicago").unwrap(),
        },
    }
}

pub fn owner(name: &str, short_id: Option<&str>) -> Company {
    Company {
        id: CompanyId::new_v7(),
        name: name.to_string(),
        short_id: short_id.map(str::to_string),
        user_id: UserId::new_v7(),
        associated_user_id: None,
        payout_account: Some(format!("acct_{}", name.to_lowercase().replace(' ', "_"))),
        contact: Contact {
            phone: Some("+13125550199".to_string()),
            email: Some(format!("{}@haulers.example", name.to_lowercase().replace(' ', "."))),
            timezone: Timezone::from_str("America/Chicago").unwrap(),
        },
    }
}

fn assignment(price: Money, commodity: CommodityKind, entries: Vec<TimeEntry>) -> Assignment {
    Assignment {
        id: AssignmentId::new_v7(),
        driver_id: UserId::new_v7(),
        truck: "TRK-12".to_string(),
        category: "tri-axle".to_string(),
        price,
        commodity,
        tons: Decimal::ZERO,
        load: Decimal::ZERO,
        time_entries: entries,
        travel_time_seconds: None,
        evidences: Vec::new(),
        loads: Vec::new(),
    }
}

fn shift(hours: i64) -> Vec<TimeEntry> {
    let start = now() - Duration::hours(hours + 2);
    vec![TimeEntry::new(start, start + Duration::hours(hours))]
}

fn job(contractor: &Company, scheduled: Vec<ScheduledJob>) -> Job {
    Job {
        id: JobId::new_v7(),
        order_number: "J1042".to_string(),
        contractor_id: contractor.id,
        due_date: now() + Duration::days(7),
        finished_at: Some(now() - Duration::hours(1)),
        invoiced_at: None,
        scheduled,
        version: 0,
    }
}

/// One owner, one driver: $50/h for 4 hours
pub fn simple_hourly_job() -> (Job, Company, HashMap<CompanyId, Company>) {
    let contractor = contractor();
    let owner = owner("Lakeside Hauling", None);
    let job = job(
        &contractor,
        vec![ScheduledJob {
            owner_company_id: owner.id,
            assignments: vec![assignment(usd(dec!(50)), CommodityKind::ByHour, shift(4))],
        }],
    );
    (job, contractor, HashMap::from([(owner.id, owner)]))
}

/// Two owners, three billable tickets and one assignment that never clocked in
///
/// Owner 1: $50/h for 4 hours, 20 tons at $12/ton. Owner 2: 5 loads at $90
/// plus the unclocked assignment.
pub fn two_owner_job() -> (Job, Company, HashMap<CompanyId, Company>) {
    let contractor = contractor();
    let first = owner("Lakeside Hauling", Some("LKS"));
    let second = owner("Prairie Trucking", None);

    let mut by_ton = assignment(usd(dec!(12)), CommodityKind::ByTon, shift(6));
    by_ton.tons = dec!(20);
    by_ton.loads = vec![LoadEvent {
        id: Some(uuid::Uuid::now_v7()),
        kind: LoadEventKind::Load,
        tons: dec!(20),
        occurred_at: now() - Duration::hours(5),
        ticket_ref: Some("SC-5531".to_string()),
        evidence: Some("scale-5531.jpg".to_string()),
    }];

    let mut by_load = assignment(usd(dec!(90)), CommodityKind::ByLoad, shift(5));
    by_load.load = dec!(5);

    let job = job(
        &contractor,
        vec![
            ScheduledJob {
                owner_company_id: first.id,
                assignments: vec![assignment(usd(dec!(50)), CommodityKind::ByHour, shift(4)), by_ton],
            },
            ScheduledJob {
                owner_company_id: second.id,
                assignments: vec![by_load, assignment(usd(dec!(50)), CommodityKind::ByHour, Vec::new())],
            },
        ],
    );
    (job, contractor, HashMap::from([(first.id, first), (second.id, second)]))
}

pub fn job_with_hourly_assignment() -> Job {
    simple_hourly_job().0
}

/// A bare job invoice for `job`, not derived from its assignments
pub fn job_invoice_for(job: &Job) -> JobInvoice {
    JobInvoice {
        id: JobInvoiceId::new_v7(),
        job_id: job.id,
        contractor_id: job.contractor_id,
        order_number: job.order_number.clone(),
        contractor_order_number: format!("{}-RDG", job.order_number),
        amount: usd(dec!(200)),
        due_date: job.due_date,
        created_at: now(),
        is_paid: false,
        paid_at: None,
        is_accepted: false,
        status: InvoiceStatus::Created,
        curr_dispute: 0,
        has_discount: None,
        events_history: EventsHistory::new(),
        payment_intent_id: None,
        customer_id: None,
        external_invoice_id: None,
        supersedes: None,
        version: 0,
    }
}

fn ticket(price: Money, commodity: CommodityKind, hours: i64, tons: Decimal, load: Decimal) -> DriverJobInvoice {
    let start = now() - Duration::hours(hours + 2);
    let entry = TimeEntry::new(start, start + Duration::hours(hours));
    let hours = Decimal::from(hours);
    DriverJobInvoice {
        id: DriverInvoiceId::new_v7(),
        owner_invoice_id: OwnerInvoiceId::new_v7(),
        job_invoice_id: JobInvoiceId::new_v7(),
        job_id: JobId::new_v7(),
        assignment_id: AssignmentId::new_v7(),
        driver_id: UserId::new_v7(),
        ticket_number: 1,
        amount: calculate_amount(price, commodity, Quantities::new(tons, load), hours),
        price,
        commodity,
        hours,
        sum_tons: tons,
        sum_load: load,
        is_accepted_by_owner: false,
        is_accepted_by_contractor: false,
        is_paid: false,
        paid_at: None,
        paid_with: None,
        time_entry: Some(entry),
        loads: Vec::new(),
        dispute_invoice: None,
        previous_dispute_invoice: None,
        curr_dispute: 0,
        created_at: now(),
        events_history: EventsHistory::new(),
        version: 0,
    }
}

/// A by-hour ticket billing `hours` whole hours at `price`
pub fn hourly_ticket(price: Decimal, hours: i64) -> DriverJobInvoice {
    ticket(usd(price), CommodityKind::ByHour, hours, Decimal::ZERO, Decimal::ZERO)
}

pub fn by_load_ticket(load: Decimal, price: Decimal) -> DriverJobInvoice {
    ticket(usd(price), CommodityKind::ByLoad, 5, Decimal::ZERO, load)
}

/// A dispute opened against `ticket`
pub fn dispute_for(ticket: &DriverJobInvoice, status: DisputeStatus) -> DisputeInvoice {
    DisputeInvoice {
        id: DisputeId::new_v7(),
        dispute_number: 1,
        status,
        request_by: UserId::new_v7(),
        request_by_role: RequesterRole::Contractor,
        reasons: vec!["Hours do not match the site log".to_string()],
        requirements: None,
        result: None,
        resolution: None,
        evidences: Vec::new(),
        result_resume: Vec::new(),
        dispute_loads: Vec::new(),
        driver_job_invoice: None,
        previous_driver_invoice: Some(ticket.id),
        result_driver_job_invoice: None,
        opened_at: now(),
        started_at: None,
        solved_at: (status == DisputeStatus::Done).then(now),
        version: 0,
    }
}

/// A contractor dispute against `ticket_id`
pub fn dispute_request(ticket_id: DriverInvoiceId, harness: &Harness) -> OpenDisputeRequest {
    OpenDisputeRequest {
        driver_invoice_id: ticket_id,
        requested_by: harness.contractor.user_id,
        role: RequesterRole::Contractor,
        reasons: vec!["Driver left site early".to_string()],
        requirements: Some("Recalculate from gate log".to_string()),
    }
}

/// A resolution that keeps the ticket's figures
pub fn upheld_resolution() -> DisputeResolution {
    DisputeResolution {
        result: "Ticket stands".to_string(),
        resolution: "Gate log matches the billed hours".to_string(),
        evidences: Vec::new(),
        resume: Vec::new(),
        outcome: DisputeOutcome::Upheld,
    }
}

/// In-memory adapters wired into an [`InvoicingEngine`], seeded with one job
pub struct Harness {
    pub store: Arc<InMemoryInvoiceStore>,
    pub directory: Arc<MockPartyDirectory>,
    pub payments: Arc<MockPaymentGateway>,
    pub notifications: Arc<RecordingNotificationGateway>,
    pub engine: InvoicingEngine,
    pub policy: BillingPolicy,
    pub job_id: JobId,
    pub contractor: Company,
    pub owners: Vec<Company>,
}

impl Harness {
    pub async fn seeded(job: Job, contractor: Company, owners: HashMap<CompanyId, Company>) -> Self {
        let store = Arc::new(InMemoryInvoiceStore::new());
        let directory = Arc::new(MockPartyDirectory::new());
        let payments = Arc::new(MockPaymentGateway::new());
        let notifications = Arc::new(RecordingNotificationGateway::new());
        let policy = BillingPolicy::default();

        directory.upsert_company(contractor.clone()).await;
        // Keep scheduled-job order so owners[0] is the first owner group
        let mut ordered = Vec::new();
        for scheduled in &job.scheduled {
            if let Some(company) = owners.get(&scheduled.owner_company_id) {
                if !ordered.iter().any(|c: &Company| c.id == company.id) {
                    directory.upsert_company(company.clone()).await;
                    ordered.push(company.clone());
                }
            }
        }
        directory
            .add_admin(Admin {
                user_id: UserId::new_v7(),
                email: Some("ops@platform.example".to_string()),
                phone: None,
            })
            .await;

        let job_id = job.id;
        store.insert_job(job).await;

        let engine = InvoicingEngine::new(
            EnginePorts {
                store: store.clone(),
                directory: directory.clone(),
                payments: payments.clone(),
                notifications: notifications.clone(),
            },
            policy.clone(),
        );

        Self {
            store,
            directory,
            payments,
            notifications,
            engine,
            policy,
            job_id,
            contractor,
            owners: ordered,
        }
    }

    pub async fn with_simple_hourly_job() -> Self {
        let (job, contractor, owners) = simple_hourly_job();
        Self::seeded(job, contractor, owners).await
    }

    pub async fn generated_simple_hourly_job() -> Self {
        let harness = Self::with_simple_hourly_job().await;
        harness.generate().await;
        harness
    }

    pub async fn generated_two_owner_job() -> Self {
        let (job, contractor, owners) = two_owner_job();
        let harness = Self::seeded(job, contractor, owners).await;
        harness.generate().await;
        harness
    }

    async fn generate(&self) {
        self.generator()
            .generate(self.job_id, now())
            .await
            .expect("fixture job generates");
    }

    pub fn generator(&self) -> &InvoiceGenerator {
        self.engine.generator()
    }

    pub fn acceptance(&self) -> &AcceptanceTracker {
        self.engine.acceptance()
    }

    pub fn disputes(&self) -> &DisputeResolutionEngine {
        self.engine.disputes()
    }

    pub fn late_fees(&self) -> &LateFeeScheduler {
        self.engine.late_fees()
    }

    pub fn cash_advances(&self) -> &CashAdvanceWorkflow {
        self.engine.cash_advances()
    }

    pub fn payouts(&self) -> &PayoutService {
        self.engine.payouts()
    }

    pub fn reconciler(&self) -> &PaymentReconciler {
        self.engine.reconciler()
    }

    pub fn owner_actor(&self) -> Actor {
        Actor::User(self.owners[0].user_id)
    }

    pub fn contractor_actor(&self) -> Actor {
        Actor::User(self.contractor.user_id)
    }

    pub fn payer(&self) -> Payer {
        Payer {
            company_id: self.contractor.id,
            email: self.contractor.contact.email.clone(),
            customer_id: None,
        }
    }

    /// The first-generation job invoice of the seeded job
    pub async fn job_invoice(&self) -> JobInvoice {
        self.store
            .job_invoices_for_job(self.job_id)
            .await
            .expect("job invoices")
            .into_iter()
            .next()
            .expect("job was generated")
    }

    /// Owner invoices of the first-generation job invoice
    pub async fn owner_invoices(&self) -> Vec<OwnerJobInvoice> {
        let job_invoice = self.job_invoice().await;
        self.store
            .owner_invoices_for_job_invoice(job_invoice.id)
            .await
            .expect("owner invoices")
    }

    /// Every ticket of the job, ordered by dispute depth then ticket number
    pub async fn tickets(&self) -> Vec<DriverJobInvoice> {
        self.store.driver_invoices_for_job(self.job_id).await
    }

    pub async fn mark_job_invoice_paid(&self, method: PaymentMethod) {
        let mut invoice = self.job_invoice().await;
        invoice
            .mark_paid(method, &Actor::System, now())
            .expect("job invoice can be paid");
        let mut changes = ChangeSet::new();
        changes.update(invoice);
        self.store.commit(changes).await.expect("job invoice paid");
    }

    /// Both sides accept every first-generation owner invoice
    pub async fn accept_everything(&self) {
        for invoice in self.owner_invoices().await {
            for party in [AcceptingParty::Owner, AcceptingParty::Contractor] {
                self.acceptance()
                    .accept_owner_invoice(invoice.id, party, Actor::System, now())
                    .await
                    .expect("owner invoice accepted");
            }
        }
    }

    /// Opens a contractor dispute on `ticket_id` and resolves it upheld
    pub async fn dispute_and_uphold(&self, ticket_id: DriverInvoiceId) -> ResolutionReport {
        let dispute = self
            .disputes()
            .create_dispute_driver(dispute_request(ticket_id, self), now())
            .await
            .expect("dispute opened");
        self.disputes()
            .mark_dispute_solved(dispute.id, upheld_resolution(), Actor::System, now())
            .await
            .expect("dispute resolved")
    }

    /// Runs the late-fee sweep just after the due date and returns the fee
    pub async fn charge_late_fee(&self) -> LateFeeInvoice {
        let invoice = self.job_invoice().await;
        self.late_fees()
            .run(invoice.due_date + Duration::hours(1))
            .await
            .expect("late fee sweep");
        self.store
            .late_fees_for_job_invoice(invoice.id)
            .await
            .expect("late fees")
            .into_iter()
            .next()
            .expect("late fee charged")
    }
}
