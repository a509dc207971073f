//! CLI argument parsing for the expctl runner.
//!
//! This module handles command line argument parsing using clap and provides
//! a structured representation of CLI configuration that the other
//! configuration components build on.

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};

/// CLI configuration structure containing all parsed command line arguments
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub verbose: bool,
    pub design: Option<String>,
    pub design_dirs: Vec<String>,
    pub no_default_designs: bool,
    pub list_designs: bool,
    pub exp_id: Option<String>,
    pub min_runs: usize,
    pub max_runs: usize,
    pub workers: Option<usize>,
    pub reschedule_delay: Option<String>,
    pub wait_timeout: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            design: None,
            design_dirs: Vec::new(),
            no_default_designs: false,
            list_designs: false,
            exp_id: None,
            min_runs: 1,
            max_runs: 1,
            workers: None,
            reschedule_delay: None,
            wait_timeout: None,
        }
    }
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let verbose = matches.get_flag("verbose");
        let no_default_designs = matches.get_flag("no-default-designs");
        let list_designs = matches.get_flag("list");

        let design = matches.get_one::<String>("design").cloned();
        let exp_id = matches.get_one::<String>("exp-id").cloned();
        let reschedule_delay = matches.get_one::<String>("reschedule-delay").cloned();
        let wait_timeout = matches.get_one::<String>("wait-timeout").cloned();
        let workers = matches.get_one::<usize>("workers").copied();

        let design_dirs: Vec<String> = matches
            .get_many::<String>("design-dir")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default();

        // --runs N is shorthand for exactly N runs
        let runs = matches.get_one::<usize>("runs").copied();
        let min_runs = matches
            .get_one::<usize>("min-runs")
            .copied()
            .or(runs)
            .unwrap_or(1);
        let max_runs = matches
            .get_one::<usize>("max-runs")
            .copied()
            .or(runs)
            .unwrap_or(min_runs);

        let config = Self {
            verbose,
            design,
            design_dirs,
            no_default_designs,
            list_designs,
            exp_id,
            min_runs,
            max_runs,
            workers,
            reschedule_delay,
            wait_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("expctl")
            .version(env!("CARGO_PKG_VERSION"))
            .about("expctl - Experiment controller")
            .long_about("Deploys, runs and tears down networking experiments described by \
                       design files, optionally repeating a run until a metric converges.")
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable verbose logging")
                    .long_help("Enable verbose debug logging. This shows every state transition, \
                              every reschedule and every driver hook invocation."),
            )
            .arg(
                Arg::new("design")
                    .short('d')
                    .long("design")
                    .value_name("DESIGN")
                    .help("Design file path or design name")
                    .long_help("Path to a .json5 design file, or the name (file stem) of a design \
                              found in one of the design directories."),
            )
            .arg(
                Arg::new("design-dir")
                    .long("design-dir")
                    .value_name("DIRECTORY")
                    .action(clap::ArgAction::Append)
                    .help("Additional directory to load design files from")
                    .long_help("Additional directory to scan for .json5 design files. \
                              Can be specified multiple times. Directories are scanned in order \
                              with later ones taking priority (can override designs with the same name). \
                              Default directories: /usr/share/expctl/designs, ~/.config/expctl/designs, ./designs"),
            )
            .arg(
                Arg::new("no-default-designs")
                    .long("no-default-designs")
                    .action(clap::ArgAction::SetTrue)
                    .help("Disable loading designs from default directories"),
            )
            .arg(
                Arg::new("list")
                    .short('l')
                    .long("list")
                    .action(clap::ArgAction::SetTrue)
                    .help("List available designs and exit"),
            )
            .arg(
                Arg::new("exp-id")
                    .long("exp-id")
                    .value_name("ID")
                    .help("Experiment identifier (overrides the design's exp_id)"),
            )
            .arg(
                Arg::new("runs")
                    .short('r')
                    .long("runs")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .help("Run the experiment exactly N times"),
            )
            .arg(
                Arg::new("min-runs")
                    .long("min-runs")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .help("Minimum number of runs before convergence is checked"),
            )
            .arg(
                Arg::new("max-runs")
                    .long("max-runs")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .help("Maximum number of runs"),
            )
            .arg(
                Arg::new("workers")
                    .short('w')
                    .long("workers")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .help("Number of worker threads for driver hooks"),
            )
            .arg(
                Arg::new("reschedule-delay")
                    .long("reschedule-delay")
                    .value_name("DURATION")
                    .help("Delay before re-checking a blocked action (e.g. 500ms)"),
            )
            .arg(
                Arg::new("wait-timeout")
                    .long("wait-timeout")
                    .value_name("DURATION")
                    .help("Give up waiting for a run to finish after this long (e.g. 10m)"),
            )
    }

    /// Validate CLI configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_runs == 0 {
            return Err(anyhow::anyhow!("Minimum number of runs must be at least 1"));
        }
        if self.max_runs < self.min_runs {
            return Err(anyhow::anyhow!(
                "Maximum number of runs ({}) is below the minimum ({})",
                self.max_runs,
                self.min_runs
            ));
        }
        if self.workers == Some(0) {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }
        if self.design.is_none() && !self.list_designs {
            return Err(anyhow::anyhow!("A design is required (use --design or --list)"));
        }
        Ok(())
    }
}
