use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub enabled: bool,
    /// Polling interval for accounts without their own interval.
    pub global_interval_minutes: u64,
    /// Service-wide override applied before the global interval.
    pub per_account_interval_minutes: Option<u64>,
    pub max_concurrent_accounts: usize,
    /// Cadence of the scheduler's decision loop.
    pub tick_seconds: u64,
    pub drain_timeout_seconds: u64,
    /// Messages handled between two cancellation checks.
    pub batch_size: usize,
    pub max_recent_errors: usize,
    pub retry: RetryConfig,
    pub limits: LimitsConfig,
    #[serde(skip_serializing)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_emails_per_run: usize,
    pub max_processing_time_seconds: u64,
    pub max_email_age_days: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            enabled: true,
            global_interval_minutes: 15,
            per_account_interval_minutes: None,
            max_concurrent_accounts: 4,
            tick_seconds: 30,
            drain_timeout_seconds: 30,
            batch_size: 10,
            max_recent_errors: 50,
            retry: RetryConfig::default(),
            limits: LimitsConfig::default(),
            database: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay_seconds: 5.0,
            max_delay_seconds: 300.0,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_emails_per_run: 100,
            max_processing_time_seconds: 300,
            max_email_age_days: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

impl ServiceConfig {
    /// Loads defaults, then the optional file, then `MAILFEED__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("mailfeed").required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("MAILFEED")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Unable to read configuration sources")?;

        let config: ServiceConfig = settings
            .try_deserialize()
            .context("Unable to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ProcessingError> {
        let fail = |msg: &str| Err(ProcessingError::Config(msg.to_string()));

        if self.global_interval_minutes == 0 {
            return fail("global_interval_minutes must be greater than 0");
        }
        if self.per_account_interval_minutes == Some(0) {
            return fail("per_account_interval_minutes must be greater than 0");
        }
        if self.max_concurrent_accounts == 0 {
            return fail("max_concurrent_accounts must be greater than 0");
        }
        if self.tick_seconds == 0 {
            return fail("tick_seconds must be greater than 0");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be greater than 0");
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return fail("retry.backoff_multiplier must be at least 1.0");
        }
        if !(self.retry.initial_delay_seconds >= 0.0)
            || self.retry.initial_delay_seconds > self.retry.max_delay_seconds
        {
            return fail("retry.initial_delay_seconds must be between 0 and max_delay_seconds");
        }
        if self.limits.max_emails_per_run == 0 {
            return fail("limits.max_emails_per_run must be greater than 0");
        }
        if self.limits.max_processing_time_seconds == 0 {
            return fail("limits.max_processing_time_seconds must be greater than 0");
        }
        if self.limits.max_email_age_days == 0 {
            return fail("limits.max_email_age_days must be greater than 0");
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn processing_budget(&self) -> Duration {
        Duration::from_secs(self.limits.max_processing_time_seconds)
    }

    /// Interval for an account, most specific setting first.
    pub fn interval_for(&self, account_interval: Option<u32>) -> Duration {
        let minutes = account_interval
            .map(u64::from)
            .or(self.per_account_interval_minutes)
            .unwrap_or(self.global_interval_minutes);
        Duration::from_secs(minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
global_interval_minutes = 5
max_concurrent_accounts = 2

[retry]
max_attempts = 4
initial_delay_seconds = 1.0
max_delay_seconds = 5.0

[limits]
max_emails_per_run = 20
"#
        )
        .unwrap();

        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.global_interval_minutes, 5);
        assert_eq!(config.max_concurrent_accounts, 2);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.limits.max_emails_per_run, 20);
        assert_eq!(config.limits.max_processing_time_seconds, 300);
        assert!(config.database.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ServiceConfig::default();
        config.max_concurrent_accounts = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.retry.initial_delay_seconds = 600.0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_precedence() {
        let mut config = ServiceConfig::default();
        assert_eq!(config.interval_for(None), Duration::from_secs(15 * 60));
        config.per_account_interval_minutes = Some(10);
        assert_eq!(config.interval_for(None), Duration::from_secs(600));
        assert_eq!(config.interval_for(Some(5)), Duration::from_secs(300));
    }
}
