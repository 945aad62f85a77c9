//! Core Kernel - Foundational types for the haulage billing workspace
//!
//! This crate provides the building blocks used by every other crate:
//! - Money and Rate types with precise decimal arithmetic
//! - Strongly-typed identifiers for jobs, invoices, disputes and parties
//! - Local-time helpers (timezones, business hours, calendar-day arithmetic)
//! - The port error type shared by every adapter

pub mod money;
pub mod temporal;
pub mod identifiers;
pub mod ports;
pub mod error;

pub use money::{Money, Currency, MoneyError, Rate};
pub use temporal::{Timezone, BusinessHours, TemporalError, whole_days_elapsed, shift_days};
pub use identifiers::{
    JobId, AssignmentId, CompanyId, UserId, TimeEntryId,
    JobInvoiceId, OwnerInvoiceId, DriverInvoiceId, DisputeId,
    LateFeeInvoiceId, ManualPaymentId,
};
pub use ports::{PortError, DomainPort};
pub use error::CoreError;
