//! Property-Based Test Generators
//!
//! Proptest strategies for finished jobs and billing policies. Generated jobs
//! always contain at least one clocked assignment, so generation succeeds.

use proptest::prelude::*;
use rust_decimal::Decimal;

use core_kernel::Rate;
use domain_invoicing::{Assignment, BillingPolicy, Company, Job};

use crate::builders::{AssignmentBuilder, CompanyBuilder, JobBuilder};

/// A generated job with the companies it references
#[derive(Debug, Clone)]
pub struct GeneratedJob {
    pub job: Job,
    pub contractor: Company,
    pub owners: Vec<Company>,
}

/// Prices between $1.00 and $250.00
pub fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..25_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// One clocked assignment of any commodity
pub fn assignment_strategy() -> impl Strategy<Value = Assignment> {
    prop_oneof![
        (price_strategy(), 15i64..720).prop_map(|(rate, minutes)| {
            AssignmentBuilder::by_hour(rate).clocked_minutes(minutes).build()
        }),
        (price_strategy(), 1u32..400).prop_map(|(price, tenths)| {
            AssignmentBuilder::by_ton(price)
                .with_scale_ticket(Decimal::new(tenths as i64, 1), "SC-GEN")
                .build()
        }),
        (price_strategy(), 1u32..12).prop_map(|(price, loads)| {
            AssignmentBuilder::by_load(price).with_loads(Decimal::from(loads)).build()
        }),
    ]
}

/// One to four owners with one to five clocked assignments each
pub fn job_strategy() -> impl Strategy<Value = GeneratedJob> {
    prop::collection::vec(prop::collection::vec(assignment_strategy(), 1..=5), 1..=4).prop_map(|groups| {
        let contractor = CompanyBuilder::new().with_short_id("GEN").build();
        let mut builder = JobBuilder::new(&contractor);
        let mut owners = Vec::new();
        for assignments in groups {
            let owner = CompanyBuilder::new().build();
            builder = builder.with_owner_group(&owner, assignments);
            owners.push(owner);
        }
        GeneratedJob {
            job: builder.build(),
            contractor,
            owners,
        }
    })
}

/// Valid policies with fee percentages up to 20% and caps up to 26
pub fn policy_strategy() -> impl Strategy<Value = BillingPolicy> {
    (0u32..=2000, 0u32..=2000, 0u32..=2000, 1u32..=26).prop_map(|(owner, advance, late, cap)| BillingPolicy {
        owner_fee: Rate::new(Decimal::new(owner as i64, 4)),
        cash_advance_fee: Rate::new(Decimal::new(advance as i64, 4)),
        late_fee: Rate::new(Decimal::new(late as i64, 4)),
        late_fee_cap: cap,
        ..BillingPolicy::default()
    })
}
