//! Configuration management for expctl.
//!
//! This module provides centralized configuration management with support for:
//! - CLI argument parsing
//! - Environment variable overrides (`EXPCTL_*`)
//! - Configuration validation
//! - Builder pattern for configuration construction

pub mod app_config;
pub mod cli;

pub use app_config::{AppConfig, AppConfigBuilder, LogLevel};
pub use cli::CliConfig;

use anyhow::Result;
use std::env;
use std::time::Duration;

use expctl_shared::errors::{ControllerError, ControllerResult};
use expctl_shared::time_spec::parse_duration;

/// Settings of one experiment controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Experiment identifier; generated when absent
    pub exp_id: Option<String>,
    /// Delay before a blocked action is re-checked
    pub reschedule_delay: Duration,
    /// Worker pool size
    pub max_workers: usize,
    /// Jobs that may wait in the worker queue before submission blocks
    pub queue_capacity: usize,
    /// How often `wait` re-checks resource states
    pub poll_interval: Duration,
    /// Hold START until every member of the deploy group is READY
    pub wait_all_ready: bool,
    /// Upper bound for a single `wait`; unbounded when absent
    pub wait_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            exp_id: None,
            reschedule_delay: Duration::from_millis(500),
            max_workers: 20,
            queue_capacity: 1000,
            poll_interval: Duration::from_millis(100),
            wait_all_ready: true,
            wait_timeout: None,
        }
    }
}

fn env_duration(name: &str) -> ControllerResult<Option<Duration>> {
    match env::var(name) {
        Ok(value) => Ok(Some(parse_duration(&value)?)),
        Err(_) => Ok(None),
    }
}

fn env_usize(name: &str) -> ControllerResult<Option<usize>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ControllerError::Config {
                message: format!("{}='{}': {}", name, value, e),
            }),
        Err(_) => Ok(None),
    }
}

impl ControllerConfig {
    pub fn with_exp_id(mut self, exp_id: impl Into<String>) -> Self {
        self.exp_id = Some(exp_id.into());
        self
    }

    pub fn with_reschedule_delay(mut self, delay: Duration) -> Self {
        self.reschedule_delay = delay;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_all_ready(mut self, wait: bool) -> Self {
        self.wait_all_ready = wait;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Defaults overridden by `EXPCTL_*` environment variables
    pub fn from_env() -> ControllerResult<Self> {
        let mut config = Self::default();
        if let Ok(exp_id) = env::var("EXPCTL_EXP_ID") {
            config.exp_id = Some(exp_id);
        }
        if let Some(delay) = env_duration("EXPCTL_RESCHEDULE_DELAY")? {
            config.reschedule_delay = delay;
        }
        if let Some(interval) = env_duration("EXPCTL_POLL_INTERVAL")? {
            config.poll_interval = interval;
        }
        if let Some(timeout) = env_duration("EXPCTL_WAIT_TIMEOUT")? {
            config.wait_timeout = Some(timeout);
        }
        if let Some(workers) = env_usize("EXPCTL_MAX_WORKERS")? {
            config.max_workers = workers;
        }
        if let Some(capacity) = env_usize("EXPCTL_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides on top of this configuration
    pub fn apply_cli(mut self, cli: &CliConfig) -> ControllerResult<Self> {
        if let Some(exp_id) = &cli.exp_id {
            self.exp_id = Some(exp_id.clone());
        }
        if let Some(workers) = cli.workers {
            self.max_workers = workers;
        }
        if let Some(delay) = &cli.reschedule_delay {
            self.reschedule_delay = parse_duration(delay)?;
        }
        if let Some(timeout) = &cli.wait_timeout {
            self.wait_timeout = Some(parse_duration(timeout)?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ControllerResult<()> {
        let invalid = |message: &str| {
            Err(ControllerError::Config {
                message: message.to_string(),
            })
        };

        if self.max_workers == 0 {
            return invalid("max_workers must be greater than 0");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be greater than 0");
        }
        if self.reschedule_delay.is_zero() {
            return invalid("reschedule_delay must be greater than 0");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be greater than 0");
        }
        if matches!(&self.exp_id, Some(id) if id.trim().is_empty()) {
            return invalid("exp_id cannot be empty");
        }
        Ok(())
    }
}

/// Main configuration manager that combines all configuration sources
#[derive(Debug, Clone)]
pub struct ConfigManager {
    pub app: AppConfig,
    pub controller: ControllerConfig,
}

impl ConfigManager {
    /// Creates a new configuration manager from CLI arguments and environment
    pub fn from_cli_and_env() -> Result<Self> {
        let cli_config = CliConfig::from_args()?;
        Self::from_cli(&cli_config)
    }

    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        let app = AppConfig::from_cli(cli_config)?;
        let controller = ControllerConfig::from_env()?.apply_cli(cli_config)?;
        Ok(Self { app, controller })
    }

    /// Validates the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.app.validate()?;
        self.controller
            .validate()
            .map_err(|e| anyhow::anyhow!("Controller configuration error: {}", e))?;
        Ok(())
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        self.app.init_logging()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.reschedule_delay, Duration::from_millis(500));
        assert_eq!(config.max_workers, 20);
        assert!(config.wait_all_ready);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_controller_validation() {
        assert!(ControllerConfig::default().with_max_workers(0).validate().is_err());
        assert!(ControllerConfig::default()
            .with_reschedule_delay(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ControllerConfig::default().with_exp_id("").validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliConfig {
            design: Some("ping".to_string()),
            exp_id: Some("from-cli".to_string()),
            workers: Some(4),
            reschedule_delay: Some("250ms".to_string()),
            wait_timeout: Some("2m".to_string()),
            ..CliConfig::default()
        };

        let config = ControllerConfig::default().apply_cli(&cli).unwrap();
        assert_eq!(config.exp_id.as_deref(), Some("from-cli"));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.reschedule_delay, Duration::from_millis(250));
        assert_eq!(config.wait_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_bad_cli_duration() {
        let cli = CliConfig {
            design: Some("ping".to_string()),
            reschedule_delay: Some("whenever".to_string()),
            ..CliConfig::default()
        };
        assert!(matches!(
            ControllerConfig::default().apply_cli(&cli),
            Err(ControllerError::TimeSpec(_))
        ));
    }

    #[test]
    fn test_config_manager_validation() {
        let cli = CliConfig {
            design: Some("ping".to_string()),
            ..CliConfig::default()
        };
        let manager = ConfigManager {
            app: AppConfig::from_cli(&cli).unwrap(),
            controller: ControllerConfig::default(),
        };
        assert!(manager.validate().is_ok());
    }
}
