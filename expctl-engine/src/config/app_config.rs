//! Application configuration for the expctl runner.
//!
//! This module handles application-level settings: logging, where designs
//! come from, and how many runs to perform.

use anyhow::Result;
use std::env;
use tracing_subscriber::EnvFilter;

use super::cli::CliConfig;

/// Log level enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn to_filter_string(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub design: Option<String>,
    pub design_dirs: Vec<String>,
    pub no_default_designs: bool,
    pub list_designs: bool,
    pub exp_id: Option<String>,
    pub min_runs: usize,
    pub max_runs: usize,
}

impl AppConfig {
    /// Create application configuration from CLI config
    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        let log_level = if cli_config.verbose {
            LogLevel::Debug
        } else {
            match env::var("RUST_LOG") {
                Ok(level_str) => Self::parse_log_level(&level_str),
                Err(_) => LogLevel::Info,
            }
        };

        Ok(Self {
            log_level,
            design: cli_config.design.clone(),
            design_dirs: cli_config.design_dirs.clone(),
            no_default_designs: cli_config.no_default_designs,
            list_designs: cli_config.list_designs,
            exp_id: cli_config.exp_id.clone(),
            min_runs: cli_config.min_runs,
            max_runs: cli_config.max_runs,
        })
    }

    /// Parse log level from string
    fn parse_log_level(level_str: &str) -> LogLevel {
        // Extract the main log level from complex RUST_LOG format
        let main_level = level_str
            .split(',')
            .next()
            .unwrap_or(level_str)
            .split('=')
            .next()
            .unwrap_or(level_str)
            .to_lowercase();

        match main_level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    /// Filter directive handed to the subscriber
    pub fn log_filter(&self) -> String {
        match env::var("RUST_LOG") {
            Ok(existing) if !existing.is_empty() && self.log_level != LogLevel::Debug => existing,
            _ => self.log_level.to_filter_string().to_string(),
        }
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        let filter = EnvFilter::try_new(self.log_filter())
            .map_err(|e| anyhow::anyhow!("Invalid log filter: {}", e))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true)
            .event_format(
                tracing_subscriber::fmt::format()
                    .with_target(false)
                    .compact(),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        tracing::info!("Logging initialized with level: {:?}", self.log_level);
        Ok(())
    }

    /// Validate application configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_runs == 0 {
            return Err(anyhow::anyhow!("Minimum number of runs must be at least 1"));
        }
        if self.max_runs < self.min_runs {
            return Err(anyhow::anyhow!(
                "Maximum number of runs must not be below the minimum"
            ));
        }
        if let Some(exp_id) = &self.exp_id {
            if exp_id.trim().is_empty() {
                return Err(anyhow::anyhow!("Experiment id cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Builder pattern for AppConfig
#[derive(Default)]
pub struct AppConfigBuilder {
    log_level: Option<LogLevel>,
    design: Option<String>,
    design_dirs: Option<Vec<String>>,
    no_default_designs: Option<bool>,
    exp_id: Option<String>,
    min_runs: Option<usize>,
    max_runs: Option<usize>,
}

impl AppConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn design<S: Into<String>>(mut self, design: S) -> Self {
        self.design = Some(design.into());
        self
    }

    pub fn design_dirs(mut self, dirs: Vec<String>) -> Self {
        self.design_dirs = Some(dirs);
        self
    }

    pub fn no_default_designs(mut self, no_defaults: bool) -> Self {
        self.no_default_designs = Some(no_defaults);
        self
    }

    pub fn exp_id<S: Into<String>>(mut self, exp_id: S) -> Self {
        self.exp_id = Some(exp_id.into());
        self
    }

    pub fn runs(mut self, min_runs: usize, max_runs: usize) -> Self {
        self.min_runs = Some(min_runs);
        self.max_runs = Some(max_runs);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig> {
        let min_runs = self.min_runs.unwrap_or(1);
        let config = AppConfig {
            log_level: self.log_level.unwrap_or(LogLevel::Info),
            design: self.design,
            design_dirs: self.design_dirs.unwrap_or_default(),
            no_default_designs: self.no_default_designs.unwrap_or(false),
            list_designs: false,
            exp_id: self.exp_id,
            min_runs,
            max_runs: self.max_runs.unwrap_or(min_runs),
        };

        config.validate()?;
        Ok(config)
    }
}
