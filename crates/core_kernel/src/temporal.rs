//! Local-time helpers
//!
//! Contractors are notified by SMS only during their local business hours and
//! due-date reminders are computed on local calendar days, so invoice logic
//! needs a serialisable timezone and a business-hours window.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use std::str::FromStr;

/// Timezone wrapper for contractor and owner locations
///
/// Wraps chrono_tz::Tz with custom serialization support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezone(pub Tz);

impl Serialize for Timezone {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.name())
    }
}

impl<'de> Deserialize<'de> for Timezone {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Tz::from_str(&s)
            .map(Timezone)
            .map_err(|_| serde::de::Error::custom(format!("Invalid timezone: {}", s)))
    }
}

impl FromStr for Timezone {
    type Err = TemporalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tz::from_str(s)
            .map(Timezone)
            .map_err(|_| TemporalError::UnknownTimezone(s.to_string()))
    }
}

impl Timezone {
    pub fn new(tz: Tz) -> Self {
        Self(tz)
    }

    /// Converts a UTC datetime to the local timezone
    pub fn to_local(&self, utc: DateTime<Utc>) -> DateTime<Tz> {
        utc.with_timezone(&self.0)
    }

    /// Local calendar date of a UTC instant
    pub fn local_date(&self, utc: DateTime<Utc>) -> NaiveDate {
        self.to_local(utc).date_naive()
    }

    /// Number of local calendar days from `from` to `to` (negative when `to` is earlier)
    pub fn calendar_days_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        (self.local_date(to) - self.local_date(from)).num_days()
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self(chrono_tz::UTC)
    }
}

/// Errors related to temporal operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemporalError {
    #[error("Invalid business hours: start {start} must be before end {end}")]
    InvalidBusinessHours {
        start: u32,
        end: u32,
    },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// A daily local window, `[start_hour, end_hour)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BusinessHours {
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self, TemporalError> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(TemporalError::InvalidBusinessHours {
                start: start_hour,
                end: end_hour,
            });
        }
        Ok(Self { start_hour, end_hour })
    }

    /// Returns true if `at` falls inside the window in the given timezone
    pub fn contains(&self, at: DateTime<Utc>, timezone: &Timezone) -> bool {
        let hour = timezone.to_local(at).hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self { start_hour: 8, end_hour: 16 }
    }
}

/// Whole days elapsed between two instants, never negative
pub fn whole_days_elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_days().max(0)
}

/// Shifts an instant forward by whole days
pub fn shift_days(at: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    at + Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_business_hours_in_local_time() {
        let hours = BusinessHours::default();
        let chicago = Timezone::from_str("America/Chicago").unwrap();

        // 14:00 UTC in January is 08:00 in Chicago
        let open = Utc.with_ymd_and_hms(2024, 1, 10, 14, 0, 0).unwrap();
        assert!(hours.contains(open, &chicago));

        // 22:30 UTC is 16:30 in Chicago
        let closed = Utc.with_ymd_and_hms(2024, 1, 10, 22, 30, 0).unwrap();
        assert!(!hours.contains(closed, &chicago));
    }

    #[test]
    fn test_invalid_business_hours() {
        assert!(BusinessHours::new(16, 8).is_err());
        assert!(BusinessHours::new(8, 25).is_err());
    }

    #[test]
    fn test_calendar_days_between_uses_local_dates() {
        let tz = Timezone::from_str("America/New_York").unwrap();
        // 03:00 UTC on the 11th is still the 10th in New York
        let from = Utc.with_ymd_and_hms(2024, 3, 11, 3, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 3, 12, 15, 0, 0).unwrap();
        assert_eq!(tz.calendar_days_between(from, to), 2);
    }

    #[test]
    fn test_whole_days_elapsed_never_negative() {
        let now = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        assert_eq!(whole_days_elapsed(now + Duration::days(1), now), 0);
        assert_eq!(whole_days_elapsed(now - Duration::hours(49), now), 2);
    }
}
