//! Execution engine for network experiments.
//!
//! The engine drives the lifecycle of remotely controlled resources (hosts,
//! interfaces, links, applications) through their backend drivers, ordering
//! every step by the connections and conditions of the experiment while a
//! single dispatch task owns all experiment state.
//!
//! # Modules
//!
//! * [`scheduler`] - Time-ordered task queue with status tracking
//! * [`worker_pool`] - Bounded pool for blocking driver work
//! * [`failure`] - Failure levels and records
//! * [`resource`] - Resource managers, lifecycle steps, driver seam, type registry
//! * [`controller`] - The experiment controller and its dispatch loop
//! * [`handles`] - Reference-counted backend handles keyed by credentials
//! * [`runner`] - Repeated runs until a metric converges
//! * [`drivers`] - Built-in `dummy::*` resource types
//! * [`design_loader`] - `.json5` designs from directories
//! * [`config`] - CLI, environment and logging configuration

pub mod config;
pub mod controller;
pub mod design_loader;
pub mod drivers;
pub mod failure;
pub mod handles;
pub mod resource;
pub mod runner;
pub mod scheduler;
pub mod utils;
pub mod worker_pool;

pub use controller::{ExperimentController, ShutdownReport, WaitReport};
pub use failure::FailureLevel;
pub use resource::{Driver, HookContext, ResourceType, TypeRegistry};
pub use runner::{ExperimentRunner, RunOptions};
