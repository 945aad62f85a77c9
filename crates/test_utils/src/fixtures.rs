//! Fixtures
//!
//! Re-exports the canned jobs and the wired in-memory [`Harness`] so that
//! integration tests use the same clock and companies as the unit tests.

pub use domain_invoicing::fixtures::{
    at_utc_hour, contractor, dispute_request, now, owner, simple_hourly_job, two_owner_job, Harness,
};

use domain_invoicing::{Company, Job};
use std::collections::HashMap;

use crate::builders::{AssignmentBuilder, JobBuilder};

/// Seeds a harness with `job`, registering every company it references
pub async fn harness_for(job: Job, contractor: Company, owners: Vec<Company>) -> Harness {
    let owners: HashMap<_, _> = owners.into_iter().map(|c| (c.id, c)).collect();
    Harness::seeded(job, contractor, owners).await
}

/// A single-owner job whose only ticket bills `minutes` at `rate` per hour
pub async fn hourly_harness(rate: rust_decimal::Decimal, minutes: i64) -> Harness {
    let contractor = contractor();
    let owner = owner("Cedar Creek Hauling", Some("CCH"));
    let job = JobBuilder::new(&contractor)
        .with_owner_group(&owner, vec![AssignmentBuilder::by_hour(rate).clocked_minutes(minutes).build()])
        .build();
    harness_for(job, contractor, vec![owner]).await
}
