//! PostgreSQL Store Tests
//!
//! Runs the invoicing engine over `PgInvoiceStore` and `PgPartyDirectory`
//! against a real database. Needs a Docker daemon, so every test is ignored
//! by default: `cargo test -p test_utils -- --ignored`.

use chrono::Duration;
use rust_decimal_macros::dec;
use std::sync::Arc;

use core_kernel::{PortError, UserId};
use domain_invoicing::ports::mock::{MockPaymentGateway, RecordingNotificationGateway};
use domain_invoicing::{
    Admin, BillingPolicy, ChangeSet, EnginePorts, InvoiceStore, InvoicingEngine, ManualPaymentRequest,
    PartyDirectory, PaymentTarget,
};
use infra_db::PgInvoiceStore;
use test_utils::{
    assert_job_balances, assert_money_eq, assert_ok, contractor, create_isolated_test_database, now, owner,
    AssignmentBuilder, JobBuilder, TestDatabase,
};

struct PgHarness {
    db: TestDatabase,
    store: Arc<PgInvoiceStore>,
    engine: InvoicingEngine,
    job_id: core_kernel::JobId,
    contractor: domain_invoicing::Company,
}

/// A migrated database seeded with a two-owner job, ready to generate
async fn pg_harness() -> PgHarness {
    let db = create_isolated_test_database().await.expect("Failed to create test database");
    let (store, directory) = db.stores();
    let store = Arc::new(store);

    let contractor = contractor();
    let first = owner("Lakeside Hauling", Some("LKS"));
    let second = owner("Prairie Trucking", None);
    let job = JobBuilder::new(&contractor)
        .with_order_number("J7001")
        .with_owner_group(&first, vec![AssignmentBuilder::by_hour(dec!(50)).build()])
        .with_owner_group(
            &second,
            vec![AssignmentBuilder::by_load(dec!(90)).with_loads(dec!(5)).build()],
        )
        .build();
    let admin = Admin {
        user_id: UserId::new_v7(),
        email: Some("ops@platform.example".to_string()),
        phone: None,
    };
    db.seed_parties(&[&contractor, &first, &second], &[admin])
        .await
        .expect("Failed to seed parties");

    let job_id = job.id;
    let mut changes = ChangeSet::new();
    changes.insert(job);
    store.commit(changes).await.expect("Failed to insert job");

    let engine = InvoicingEngine::new(
        EnginePorts {
            store: store.clone(),
            directory: Arc::new(directory),
            payments: Arc::new(MockPaymentGateway::new()),
            notifications: Arc::new(RecordingNotificationGateway::new()),
        },
        BillingPolicy::default(),
    );

    PgHarness {
        db,
        store,
        engine,
        job_id,
        contractor,
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_generated_tree_round_trips_through_jsonb() {
    let h = pg_harness().await;
    let report = assert_ok!(h.engine.generator().generate(h.job_id, now()).await);

    let job_invoices = assert_ok!(h.store.job_invoices_for_job(h.job_id).await);
    assert_eq!(job_invoices.len(), 1);
    let job_invoice = &job_invoices[0];
    assert_eq!(job_invoice.id, report.job_invoice_id);
    assert_money_eq(&job_invoice.amount, dec!(650));

    let owners = assert_ok!(h.store.owner_invoices_for_job_invoice(job_invoice.id).await);
    let numbers: Vec<u32> = owners.iter().map(|o| o.invoice_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_job_balances(job_invoice, &owners);

    let tickets = assert_ok!(h.store.driver_invoices_for_owner_invoice(owners[1].id).await);
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].ticket_number, 2);

    let job = assert_ok!(h.store.get_job(h.job_id).await);
    assert!(job.is_invoiced());

    let latest = assert_ok!(h.store.latest_owner_invoice_by_order("J7001-LKS").await);
    assert_eq!(latest.map(|o| o.id), Some(owners[0].id));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stale_update_is_a_conflict() {
    let h = pg_harness().await;
    assert_ok!(h.engine.generator().generate(h.job_id, now()).await);
    let invoice = assert_ok!(h.store.job_invoices_for_job(h.job_id).await).remove(0);

    let mut first = ChangeSet::new();
    first.update(invoice.clone());
    assert_ok!(h.store.commit(first).await);

    let mut stale = ChangeSet::new();
    stale.update(invoice.clone());
    let err = h.store.commit(stale).await.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err:?}");

    let stored = assert_ok!(h.store.get_job_invoice(invoice.id).await);
    assert_eq!(stored.version, invoice.version + 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_missing_record_is_not_found() {
    let h = pg_harness().await;
    let err = h
        .store
        .get_job_invoice(core_kernel::JobInvoiceId::new_v7())
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::NotFound { .. }));

    let (_, directory) = h.db.stores();
    assert!(directory.company(core_kernel::CompanyId::new_v7()).await.unwrap_err().is_not_found());
    assert_eq!(assert_ok!(directory.company(h.contractor.id).await), h.contractor);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_dispute_numbers_increase() {
    let h = pg_harness().await;
    let first = assert_ok!(h.store.next_dispute_number().await);
    let second = assert_ok!(h.store.next_dispute_number().await);
    assert!(second > first);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_sweep_queries_follow_due_dates() {
    let h = pg_harness().await;
    assert_ok!(h.engine.generator().generate(h.job_id, now()).await);
    let invoice = assert_ok!(h.store.job_invoices_for_job(h.job_id).await).remove(0);

    let before = assert_ok!(h.store.overdue_job_invoices(invoice.due_date - Duration::hours(1)).await);
    assert!(before.is_empty());

    let report = assert_ok!(h.engine.late_fees().run(invoice.due_date + Duration::hours(1)).await);
    assert_eq!(report.changed, 1);
    let fees = assert_ok!(h.store.late_fees_for_job_invoice(invoice.id).await);
    assert_money_eq(&fees[0].amount, dec!(26.00));

    let pending = assert_ok!(h.store.owner_invoices_pending_acceptance().await);
    assert_eq!(pending.len(), 2);
    let due_soon = assert_ok!(
        h.store
            .unpaid_job_invoices_due_between(invoice.due_date - Duration::days(1), invoice.due_date + Duration::days(1))
            .await
    );
    assert_eq!(due_soon.len(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_manual_payments_are_found_by_target() {
    let h = pg_harness().await;
    assert_ok!(h.engine.generator().generate(h.job_id, now()).await);
    let invoice = assert_ok!(h.store.job_invoices_for_job(h.job_id).await).remove(0);
    let target = PaymentTarget::JobInvoice(invoice.id);

    let payment = assert_ok!(
        h.engine
            .reconciler()
            .submit_manual_payment(
                ManualPaymentRequest {
                    target,
                    account_number: "000123456789".to_string(),
                    attachments: vec!["wire-receipt.pdf".to_string()],
                },
                domain_invoicing::Actor::User(h.contractor.user_id),
                now(),
            )
            .await
    );

    let found = assert_ok!(h.store.manual_payments_for(target).await);
    assert_eq!(found.iter().map(|p| p.id).collect::<Vec<_>>(), vec![payment.id]);
    let other = assert_ok!(
        h.store
            .manual_payments_for(PaymentTarget::LateFee(core_kernel::LateFeeInvoiceId::new_v7()))
            .await
    );
    assert!(other.is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_dispute_resolution_commits_next_level() {
    let h = pg_harness().await;
    assert_ok!(h.engine.generator().generate(h.job_id, now()).await);
    let invoice = assert_ok!(h.store.job_invoices_for_job(h.job_id).await).remove(0);
    let owner = assert_ok!(h.store.owner_invoices_for_job_invoice(invoice.id).await).remove(0);
    let ticket = assert_ok!(h.store.driver_invoices_for_owner_invoice(owner.id).await).remove(0);

    let request = dispute_request_for(ticket.id, &h);
    let dispute = assert_ok!(h.engine.disputes().create_dispute_driver(request, now()).await);
    let report = assert_ok!(
        h.engine
            .disputes()
            .mark_dispute_solved(
                dispute.id,
                domain_invoicing::DisputeResolution {
                    result: "Upheld".to_string(),
                    resolution: "Matches the gate log".to_string(),
                    evidences: Vec::new(),
                    resume: Vec::new(),
                    outcome: domain_invoicing::DisputeOutcome::Upheld,
                },
                domain_invoicing::Actor::System,
                now(),
            )
            .await
    );

    let levels = assert_ok!(h.store.job_invoices_for_job(h.job_id).await);
    assert_eq!(levels.iter().map(|j| j.curr_dispute).collect::<Vec<_>>(), vec![0, 1]);
    let latest = assert_ok!(h.store.latest_job_invoice_by_order("J7001").await);
    assert_eq!(latest.map(|j| j.id), Some(report.job_invoice_id));
}

/// A contractor dispute against `ticket_id`
fn dispute_request_for(ticket_id: core_kernel::DriverInvoiceId, h: &PgHarness) -> domain_invoicing::OpenDisputeRequest {
    domain_invoicing::OpenDisputeRequest {
        driver_invoice_id: ticket_id,
        requested_by: h.contractor.user_id,
        role: domain_invoicing::RequesterRole::Contractor,
        reasons: vec!["Driver left site early".to_string()],
        requirements: None,
    }
}
