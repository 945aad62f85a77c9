//! Test Data Builders
//!
//! Builders for the inputs of invoice generation: companies, assignments and
//! finished jobs. Tests set only the fields they care about; everything else
//! defaults to a clocked, billable value anchored on [`fixtures::now`].
//!
//! [`fixtures::now`]: crate::fixtures::now

use chrono::{DateTime, Duration, Utc};
use fake::faker::company::en::CompanyName;
use fake::Fake;
use rust_decimal::Decimal;
use std::str::FromStr;

use core_kernel::{AssignmentId, CompanyId, Currency, JobId, Money, Timezone, UserId};
use domain_invoicing::job::LoadEventKind;
use domain_invoicing::{Assignment, CommodityKind, Company, Contact, Job, LoadEvent, ScheduledJob, TimeEntry};

use crate::fixtures::now;

/// Builder for owner and contractor companies
pub struct CompanyBuilder {
    name: String,
    short_id: Option<String>,
    associated_user_id: Option<UserId>,
    payout_account: Option<String>,
    timezone: String,
}

impl Default for CompanyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CompanyBuilder {
    /// A company with a random name and a payout account
    pub fn new() -> Self {
        Self {
            name: CompanyName().fake(),
            short_id: None,
            associated_user_id: None,
            payout_account: Some(format!("acct_{}", uuid::Uuid::new_v4().simple())),
            timezone: "America/Chicago".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_short_id(mut self, short_id: impl Into<String>) -> Self {
        self.short_id = Some(short_id.into());
        self
    }

    /// Points this company at `other`'s user; association needs both sides
    pub fn associated_with(mut self, other: &Company) -> Self {
        self.associated_user_id = Some(other.user_id);
        self
    }

    pub fn without_payout_account(mut self) -> Self {
        self.payout_account = None;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// # Panics
    ///
    /// Panics if the timezone is not an IANA name
    pub fn build(self) -> Company {
        let slug = self.name.to_lowercase().replace(|c: char| !c.is_ascii_alphanumeric(), ".");
        Company {
            id: CompanyId::new_v7(),
            name: self.name,
            short_id: self.short_id,
            user_id: UserId::new_v7(),
            associated_user_id: self.associated_user_id,
            payout_account: self.payout_account,
            contact: Contact {
                phone: Some("+13125550142".to_string()),
                email: Some(format!("{}@haulers.example", slug)),
                timezone: Timezone::from_str(&self.timezone).expect("valid IANA timezone"),
            },
        }
    }
}

/// Builder for a driver assignment
pub struct AssignmentBuilder {
    price: Money,
    commodity: CommodityKind,
    tons: Decimal,
    load: Decimal,
    time_entries: Vec<TimeEntry>,
    travel_time_seconds: Option<i64>,
    loads: Vec<LoadEvent>,
}

impl AssignmentBuilder {
    fn priced(price: Decimal, commodity: CommodityKind) -> Self {
        Self {
            price: Money::new(price, Currency::USD),
            commodity,
            tons: Decimal::ZERO,
            load: Decimal::ZERO,
            time_entries: Vec::new(),
            travel_time_seconds: None,
            loads: Vec::new(),
        }
    }

    /// Billed per hour, clocked for four hours
    pub fn by_hour(rate: Decimal) -> Self {
        Self::priced(rate, CommodityKind::ByHour).clocked_minutes(240)
    }

    /// Billed per ton; tons default to zero
    pub fn by_ton(price: Decimal) -> Self {
        Self::priced(price, CommodityKind::ByTon).clocked_minutes(360)
    }

    /// Billed per load; loads default to zero
    pub fn by_load(price: Decimal) -> Self {
        Self::priced(price, CommodityKind::ByLoad).clocked_minutes(300)
    }

    /// Replaces the time entries with one shift of `minutes` ending two hours before now
    pub fn clocked_minutes(mut self, minutes: i64) -> Self {
        let end = now() - Duration::hours(2);
        self.time_entries = vec![TimeEntry::new(end - Duration::minutes(minutes), end)];
        self
    }

    pub fn with_shift(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_entries.push(TimeEntry::new(start, end));
        self
    }

    /// No time entries: the assignment is not billable
    pub fn unclocked(mut self) -> Self {
        self.time_entries.clear();
        self
    }

    pub fn with_travel_minutes(mut self, minutes: i64) -> Self {
        self.travel_time_seconds = Some(minutes * 60);
        self
    }

    /// Adds a scale ticket to the load ledger and to the ton total
    pub fn with_scale_ticket(mut self, tons: Decimal, reference: &str) -> Self {
        self.tons += tons;
        self.loads.push(LoadEvent {
            id: Some(uuid::Uuid::now_v7()),
            kind: LoadEventKind::Load,
            tons,
            occurred_at: now() - Duration::hours(3),
            ticket_ref: Some(reference.to_string()),
            evidence: None,
        });
        self
    }

    pub fn with_loads(mut self, load: Decimal) -> Self {
        self.load = load;
        self
    }

    pub fn build(self) -> Assignment {
        Assignment {
            id: AssignmentId::new_v7(),
            driver_id: UserId::new_v7(),
            truck: "TRK-7".to_string(),
            category: "end-dump".to_string(),
            price: self.price,
            commodity: self.commodity,
            tons: self.tons,
            load: self.load,
            time_entries: self.time_entries,
            travel_time_seconds: self.travel_time_seconds,
            evidences: Vec::new(),
            loads: self.loads,
        }
    }
}

/// Builder for a finished job
pub struct JobBuilder {
    contractor_id: CompanyId,
    order_number: String,
    due_date: DateTime<Utc>,
    scheduled: Vec<ScheduledJob>,
}

impl JobBuilder {
    pub fn new(contractor: &Company) -> Self {
        Self {
            contractor_id: contractor.id,
            order_number: "J2001".to_string(),
            due_date: now() + Duration::days(7),
            scheduled: Vec::new(),
        }
    }

    pub fn with_order_number(mut self, order_number: impl Into<String>) -> Self {
        self.order_number = order_number.into();
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = due_date;
        self
    }

    /// Adds one scheduled-job group for `owner`
    pub fn with_owner_group(mut self, owner: &Company, assignments: Vec<Assignment>) -> Self {
        self.scheduled.push(ScheduledJob {
            owner_company_id: owner.id,
            assignments,
        });
        self
    }

    pub fn build(self) -> Job {
        Job {
            id: JobId::new_v7(),
            order_number: self.order_number,
            contractor_id: self.contractor_id,
            due_date: self.due_date,
            finished_at: Some(now() - Duration::hours(1)),
            invoiced_at: None,
            scheduled: self.scheduled,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_by_hour_defaults_to_four_billable_hours() {
        let assignment = AssignmentBuilder::by_hour(dec!(50)).build();
        assert!(assignment.is_billable());
        assert_eq!(assignment.billable_hours(), dec!(4));
    }

    #[test]
    fn test_unclocked_assignment_is_not_billable() {
        let assignment = AssignmentBuilder::by_load(dec!(90)).with_loads(dec!(3)).unclocked().build();
        assert!(!assignment.is_billable());
    }

    #[test]
    fn test_scale_tickets_accumulate_tons() {
        let assignment = AssignmentBuilder::by_ton(dec!(12))
            .with_scale_ticket(dec!(11.5), "SC-1")
            .with_scale_ticket(dec!(8.5), "SC-2")
            .build();
        assert_eq!(assignment.tons, dec!(20));
        assert_eq!(assignment.loads.len(), 2);
    }

    #[test]
    fn test_association_requires_both_sides() {
        let contractor = CompanyBuilder::new().build();
        let one_sided = CompanyBuilder::new().associated_with(&contractor).build();
        assert!(!one_sided.is_associated_with(&contractor));
    }
}
