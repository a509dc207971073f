//! Experiment-wide failure tracking.
//!
//! The failure level only ever rises. A failing ad hoc task raises it to
//! [`FailureLevel::TaskFailure`], a failing critical resource to
//! [`FailureLevel::ResourceFailure`], and a broken dispatch loop to
//! [`FailureLevel::ExperimentFailure`], which aborts every wait. Failures of
//! non-critical resources are recorded but leave the level untouched.

use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{error, warn};

use crate::scheduler::TaskId;
use expctl_shared::Guid;

/// Severity of the worst failure seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureLevel {
    #[default]
    Ok,
    TaskFailure,
    ResourceFailure,
    ExperimentFailure,
}

impl fmt::Display for FailureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureLevel::Ok => "OK",
            FailureLevel::TaskFailure => "TASK_FAILURE",
            FailureLevel::ResourceFailure => "RESOURCE_FAILURE",
            FailureLevel::ExperimentFailure => "EXPERIMENT_FAILURE",
        };
        f.write_str(name)
    }
}

/// What failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSource {
    Task(TaskId),
    Resource { guid: Guid, critical: bool },
    Experiment,
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub source: FailureSource,
    pub message: String,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct FailureManager {
    level: FailureLevel,
    records: Vec<FailureRecord>,
}

impl FailureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> FailureLevel {
        self.level
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn is_aborted(&self) -> bool {
        self.level == FailureLevel::ExperimentFailure
    }

    /// Message of the failure that aborted the experiment
    pub fn abort_reason(&self) -> Option<String> {
        if !self.is_aborted() {
            return None;
        }
        self.records
            .iter()
            .find(|r| r.source == FailureSource::Experiment)
            .map(|r| r.message.clone())
    }

    fn raise(&mut self, level: FailureLevel) {
        self.level = self.level.max(level);
    }

    fn push(&mut self, source: FailureSource, message: String) {
        self.records.push(FailureRecord {
            source,
            message,
            at: Instant::now(),
        });
    }

    pub fn task_failed(&mut self, task: TaskId, message: impl Into<String>) {
        let message = message.into();
        warn!("Task {} failed: {}", task, message);
        self.push(FailureSource::Task(task), message);
        self.raise(FailureLevel::TaskFailure);
    }

    pub fn resource_failed(&mut self, guid: Guid, critical: bool, message: impl Into<String>) {
        let message = message.into();
        if critical {
            error!("Critical resource {} failed: {}", guid, message);
            self.raise(FailureLevel::ResourceFailure);
        } else {
            warn!("Non-critical resource {} failed: {}", guid, message);
        }
        self.push(FailureSource::Resource { guid, critical }, message);
    }

    pub fn experiment_failed(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("Experiment failure: {}", message);
        self.push(FailureSource::Experiment, message);
        self.raise(FailureLevel::ExperimentFailure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_only_rises() {
        let mut failures = FailureManager::new();
        assert_eq!(failures.level(), FailureLevel::Ok);

        failures.resource_failed(Guid(1), true, "deploy failed");
        assert_eq!(failures.level(), FailureLevel::ResourceFailure);

        failures.task_failed(7, "callback failed");
        assert_eq!(failures.level(), FailureLevel::ResourceFailure);
        assert_eq!(failures.records().len(), 2);
    }

    #[test]
    fn test_non_critical_failure_keeps_level() {
        let mut failures = FailureManager::new();
        failures.resource_failed(Guid(4), false, "optional probe missing");
        assert_eq!(failures.level(), FailureLevel::Ok);
        assert_eq!(failures.records().len(), 1);
    }

    #[test]
    fn test_experiment_failure_aborts() {
        let mut failures = FailureManager::new();
        assert!(failures.abort_reason().is_none());
        failures.experiment_failed("dispatch loop broke");
        assert!(failures.is_aborted());
        assert_eq!(failures.abort_reason().as_deref(), Some("dispatch loop broke"));
        assert_eq!(failures.level().to_string(), "EXPERIMENT_FAILURE");
    }
}
