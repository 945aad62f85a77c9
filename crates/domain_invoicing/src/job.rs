//! Finished-job input records
//!
//! A job is fulfilled by one or more owner companies ("scheduled jobs"), each
//! providing driver assignments. Assignments carry the time entries, hauled
//! quantities and load ledger that tickets are priced from. Dispute resolution
//! writes the agreed figures back onto the assignment, so the job is versioned
//! like every invoice record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use core_kernel::{AssignmentId, CompanyId, JobId, Money, TimeEntryId, UserId};

use crate::pricing::{CommodityKind, Quantities};

const SECONDS_PER_HOUR: i64 = 3600;

/// A clocked work window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: TimeEntryId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeEntry {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: TimeEntryId::new_v7(),
            start,
            end,
        }
    }

    /// Duration in hours; an inverted window counts as zero
    pub fn hours(&self) -> Decimal {
        seconds_to_hours((self.end - self.start).num_seconds().max(0))
    }
}

pub(crate) fn seconds_to_hours(seconds: i64) -> Decimal {
    Decimal::from(seconds) / Decimal::from(SECONDS_PER_HOUR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadEventKind {
    Load,
    Dump,
}

/// One entry of an assignment's load/dump ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEvent {
    pub id: Option<Uuid>,
    pub kind: LoadEventKind,
    pub tons: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub ticket_ref: Option<String>,
    pub evidence: Option<String>,
}

/// One driver + truck + category commitment within a scheduled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub driver_id: UserId,
    pub truck: String,
    pub category: String,
    pub price: Money,
    pub commodity: CommodityKind,
    pub tons: Decimal,
    pub load: Decimal,
    pub time_entries: Vec<TimeEntry>,
    /// Supervisor-adjusted travel time in seconds
    pub travel_time_seconds: Option<i64>,
    pub evidences: Vec<String>,
    pub loads: Vec<LoadEvent>,
}

impl Assignment {
    /// Sum of clocked hours plus positive travel time
    pub fn billable_hours(&self) -> Decimal {
        let clocked: Decimal = self.time_entries.iter().map(TimeEntry::hours).sum();
        clocked + self.travel_hours()
    }

    pub fn travel_hours(&self) -> Decimal {
        match self.travel_time_seconds {
            Some(seconds) if seconds > 0 => seconds_to_hours(seconds),
            _ => Decimal::ZERO,
        }
    }

    pub fn quantities(&self) -> Quantities {
        Quantities::new(self.tons, self.load)
    }

    /// Earliest start to latest end across all time entries
    pub fn work_window(&self) -> Option<TimeEntry> {
        let start = self.time_entries.iter().map(|e| e.start).min()?;
        let end = self.time_entries.iter().map(|e| e.end).max()?;
        Some(TimeEntry::new(start, end))
    }

    /// Whether the driver ever clocked in
    pub fn is_billable(&self) -> bool {
        !self.time_entries.is_empty()
    }
}

/// The part of a job fulfilled by one owner company
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub owner_company_id: CompanyId,
    pub assignments: Vec<Assignment>,
}

/// A hauling job owned by a contractor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub order_number: String,
    pub contractor_id: CompanyId,
    /// Payment due date agreed for the job
    pub due_date: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the invoice tree has been generated
    pub invoiced_at: Option<DateTime<Utc>>,
    pub scheduled: Vec<ScheduledJob>,
    pub version: u64,
}

impl Job {
    pub fn assignment(&self, id: AssignmentId) -> Option<&Assignment> {
        self.scheduled
            .iter()
            .flat_map(|s| s.assignments.iter())
            .find(|a| a.id == id)
    }

    pub fn assignment_mut(&mut self, id: AssignmentId) -> Option<&mut Assignment> {
        self.scheduled
            .iter_mut()
            .flat_map(|s| s.assignments.iter_mut())
            .find(|a| a.id == id)
    }

    pub fn is_invoiced(&self) -> bool {
        self.invoiced_at.is_some()
    }
}
