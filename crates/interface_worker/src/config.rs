//! Worker configuration

use serde::Deserialize;
use std::time::Duration;

use domain_invoicing::BillingPolicy;

use crate::error::WorkerError;

/// How often each scheduled sweep runs, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SweepCadence {
    pub late_fee_secs: u64,
    pub auto_accept_secs: u64,
    pub transfer_secs: u64,
    pub reminder_secs: u64,
}

impl Default for SweepCadence {
    fn default() -> Self {
        Self {
            late_fee_secs: 60 * 60,
            auto_accept_secs: 15 * 60,
            transfer_secs: 15 * 60,
            reminder_secs: 60 * 60,
        }
    }
}

impl SweepCadence {
    pub fn late_fee(&self) -> Duration {
        Duration::from_secs(self.late_fee_secs)
    }

    pub fn auto_accept(&self) -> Duration {
        Duration::from_secs(self.auto_accept_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    pub fn reminder(&self) -> Duration {
        Duration::from_secs(self.reminder_secs)
    }
}

/// Worker configuration
///
/// Read from `WORKER_`-prefixed environment variables; nested fields use a
/// double underscore, e.g. `WORKER_POLICY__LATE_FEE_CAP=10` or
/// `WORKER_SWEEPS__TRANSFER_SECS=300`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Read newline-delimited inbound events from stdin
    pub read_events_from_stdin: bool,
    pub sweeps: SweepCadence,
    pub policy: BillingPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/haulage_billing".to_string(),
            max_connections: 10,
            log_level: "info".to_string(),
            read_events_from_stdin: true,
            sweeps: SweepCadence::default(),
            policy: BillingPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the environment and validates it
    pub fn from_env() -> Result<Self, WorkerError> {
        let config: WorkerConfig = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("WORKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        self.policy.validate().map_err(WorkerError::InvalidPolicy)?;
        let cadences = [
            self.sweeps.late_fee_secs,
            self.sweeps.auto_accept_secs,
            self.sweeps.transfer_secs,
            self.sweeps.reminder_secs,
        ];
        if cadences.contains(&0) {
            return Err(WorkerError::InvalidConfig("sweep cadence must be at least one second".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweeps.transfer(), Duration::from_secs(900));
        assert_eq!(config.policy.late_fee_cap, 26);
    }

    #[test]
    fn test_zero_cadence_is_rejected() {
        let mut config = WorkerConfig::default();
        config.sweeps.reminder_secs = 0;
        assert!(matches!(config.validate(), Err(WorkerError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_document_falls_back_to_defaults() {
        let config: WorkerConfig = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://db/billing",
            "policy": { "late_fee_cap": 3 }
        }))
        .unwrap();
        assert_eq!(config.database_url, "postgres://db/billing");
        assert_eq!(config.policy.late_fee_cap, 3);
        assert_eq!(config.policy.owner_grace_days, 5);
        assert_eq!(config.sweeps, SweepCadence::default());
    }
}
