//! Billing rates and time limits

use chrono::Duration;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use core_kernel::{BusinessHours, CoreError, Currency, Rate};

/// Tunable billing parameters
///
/// Deserialisable so the worker can load it from configuration; every field
/// falls back to its default when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingPolicy {
    pub currency: Currency,
    /// Platform fee withheld from owner invoices
    pub owner_fee: Rate,
    /// Extra fee for paying an owner ahead of schedule
    pub cash_advance_fee: Rate,
    /// Charge rate of each late-fee recharge
    pub late_fee: Rate,
    /// Maximum number of late-fee invoices per job invoice
    pub late_fee_cap: u32,
    pub late_fee_cooldown_hours: i64,
    pub late_fee_due_days: i64,
    /// Days after the job due date that owners are due
    pub owner_grace_days: i64,
    pub auto_accept_hours: i64,
    pub reminder_days_ahead: i64,
    pub business_hours: BusinessHours,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            currency: Currency::USD,
            owner_fee: Rate::new(dec!(0.06)),
            cash_advance_fee: Rate::new(dec!(0.03)),
            late_fee: Rate::new(dec!(0.04)),
            late_fee_cap: 26,
            late_fee_cooldown_hours: 24,
            late_fee_due_days: 7,
            owner_grace_days: 5,
            auto_accept_hours: 48,
            reminder_days_ahead: 2,
            business_hours: BusinessHours::default(),
        }
    }
}

impl BillingPolicy {
    /// Rejects settings the schedulers cannot honour
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, rate) in [
            ("owner_fee", self.owner_fee),
            ("cash_advance_fee", self.cash_advance_fee),
            ("late_fee", self.late_fee),
        ] {
            let value = rate.as_decimal();
            if value < dec!(0) || value >= dec!(1) {
                return Err(CoreError::configuration(format!(
                    "{} must be in [0, 1), got {}",
                    name, value
                )));
            }
        }
        // Late-fee suffixes are single letters A..Z
        if self.late_fee_cap > 26 {
            return Err(CoreError::configuration(format!(
                "late_fee_cap must not exceed 26, got {}",
                self.late_fee_cap
            )));
        }
        if self.late_fee_cooldown_hours < 0
            || self.late_fee_due_days < 0
            || self.owner_grace_days < 0
            || self.auto_accept_hours < 0
            || self.reminder_days_ahead < 0
        {
            return Err(CoreError::configuration("durations must not be negative"));
        }
        // Re-validate in case the window came from deserialisation
        BusinessHours::new(self.business_hours.start_hour, self.business_hours.end_hour)?;
        Ok(())
    }

    pub fn late_fee_cooldown(&self) -> Duration {
        Duration::hours(self.late_fee_cooldown_hours)
    }

    pub fn auto_accept_after(&self) -> Duration {
        Duration::hours(self.auto_accept_hours)
    }
}
