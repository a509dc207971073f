//! Repeated experiment runs.
//!
//! [`ExperimentRunner`] replays one design in a fresh controller per run. With
//! a metric, runs continue past `min_runs` until the 95% confidence interval
//! of the metric's mean is narrower than 5% of the mean, or `max_runs` is hit.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::config::ControllerConfig;
use crate::controller::{ExperimentController, ShutdownReport, WaitReport};
use crate::failure::FailureLevel;
use crate::resource::TypeRegistry;
use expctl_shared::errors::{ControllerError, ControllerResult};
use expctl_shared::{ExperimentDesign, Guid};

/// How a design is repeated
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub min_runs: usize,
    pub max_runs: usize,
    /// Resources whose end marks the end of a run. When empty a run ends
    /// once every resource has started.
    pub wait_guids: Vec<Guid>,
    /// Fixed run time instead of waiting for resources to finish
    pub wait_time: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            min_runs: 1,
            max_runs: 1,
            wait_guids: Vec::new(),
            wait_time: None,
        }
    }
}

/// What happened in one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: usize,
    pub exp_id: String,
    pub elapsed: Duration,
    pub wait: Option<WaitReport>,
    /// Why waiting ended early, if it did
    pub error: Option<String>,
    pub shutdown: ShutdownReport,
}

impl RunSummary {
    pub fn failure_level(&self) -> FailureLevel {
        self.shutdown.failure_level
    }
}

/// All runs of a design
#[derive(Debug, Clone, Serialize)]
pub struct RunnerReport {
    pub runs: Vec<RunSummary>,
    pub samples: Vec<f64>,
    pub converged: bool,
}

impl RunnerReport {
    /// Worst failure level over all runs
    pub fn failure_level(&self) -> FailureLevel {
        self.runs
            .iter()
            .map(RunSummary::failure_level)
            .max()
            .unwrap_or_default()
    }
}

/// Whether `samples` pin down their mean: twice the standard error below
/// 5% of the mean
pub fn has_converged(samples: &[f64]) -> bool {
    if samples.len() < 2 {
        return false;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    2.0 * variance.sqrt() / n.sqrt() < 0.05 * mean
}

pub struct ExperimentRunner {
    config: ControllerConfig,
    types: TypeRegistry,
}

impl ExperimentRunner {
    pub fn new(config: ControllerConfig, types: TypeRegistry) -> Self {
        Self { config, types }
    }

    /// Run `design` exactly `max_runs` times
    pub async fn run(&self, design: &ExperimentDesign, options: &RunOptions) -> ControllerResult<RunnerReport> {
        self.execute(design, options, None).await
    }

    /// Run `design` until the metric converges or `max_runs` is reached
    pub async fn run_with_metric<M>(
        &self,
        design: &ExperimentDesign,
        options: &RunOptions,
        mut metric: M,
    ) -> ControllerResult<RunnerReport>
    where
        M: FnMut(&RunSummary) -> f64,
    {
        let metric: &mut dyn FnMut(&RunSummary) -> f64 = &mut metric;
        self.execute(design, options, Some(metric)).await
    }

    async fn execute(
        &self,
        design: &ExperimentDesign,
        options: &RunOptions,
        mut metric: Option<&mut dyn FnMut(&RunSummary) -> f64>,
    ) -> ControllerResult<RunnerReport> {
        if options.min_runs == 0 || options.max_runs < options.min_runs {
            return Err(ControllerError::Config {
                message: format!(
                    "invalid run bounds: min {} / max {}",
                    options.min_runs, options.max_runs
                ),
            });
        }

        let base = self
            .config
            .exp_id
            .clone()
            .or_else(|| design.exp_id.clone())
            .unwrap_or_else(|| "experiment".to_string());

        let mut report = RunnerReport {
            runs: Vec::new(),
            samples: Vec::new(),
            converged: false,
        };

        for run in 1..=options.max_runs {
            let exp_id = format!("{}-run{}", base, run);
            let summary = self.run_once(run, &exp_id, design, options).await?;

            if let Some(metric) = metric.as_deref_mut() {
                report.samples.push(metric(&summary));
            }
            report.runs.push(summary);

            if metric.is_some() && run >= options.min_runs && has_converged(&report.samples) {
                info!("Metric converged after {} runs", run);
                report.converged = true;
                break;
            }
        }

        if metric.is_some() && !report.converged {
            warn!("Metric did not converge within {} runs", options.max_runs);
        }
        Ok(report)
    }

    #[instrument(skip(self, design, options))]
    async fn run_once(
        &self,
        run: usize,
        exp_id: &str,
        design: &ExperimentDesign,
        options: &RunOptions,
    ) -> ControllerResult<RunSummary> {
        let config = self.config.clone().with_exp_id(exp_id);
        let started = Instant::now();
        let ec = ExperimentController::from_design(config, self.types.clone(), design).await?;

        let waited = self.drive(&ec, options).await;
        let shutdown = ec.shutdown().await?;
        let elapsed = started.elapsed();

        let (wait, error) = match waited {
            Ok(wait) => (wait, None),
            Err(e) => {
                warn!("Run {} ended early: {}", run, e);
                (None, Some(e.to_string()))
            }
        };
        info!(
            "Run {} finished in {:?} ({})",
            run, elapsed, shutdown.failure_level
        );

        Ok(RunSummary {
            run,
            exp_id: exp_id.to_string(),
            elapsed,
            wait,
            error,
            shutdown,
        })
    }

    async fn drive(
        &self,
        ec: &ExperimentController,
        options: &RunOptions,
    ) -> ControllerResult<Option<WaitReport>> {
        ec.deploy().await?;

        if let Some(wait_time) = options.wait_time {
            tokio::time::sleep(wait_time).await;
            return Ok(None);
        }

        if options.wait_guids.is_empty() {
            let guids = ec.resources().await?;
            return ec.wait_started(&guids).await.map(Some);
        }
        ec.wait_finished(&options.wait_guids).await.map(Some)
    }
}
