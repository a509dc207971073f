use std::time::Duration;
use thiserror::Error;

use crate::{Guid, ResourceAction, ResourceState};

/// Illegal attribute mutation given its flags, type or the resource state
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unknown attribute '{name}' for resource type '{rtype}'")]
    UnknownAttribute { rtype: String, name: String },

    #[error("Attribute '{name}' can only be set at design time (resource is {state})")]
    DesignOnly { name: String, state: ResourceState },

    #[error("Attribute '{name}' can only be set before provisioning (resource is {state})")]
    ConstructOnly { name: String, state: ResourceState },

    #[error("Attribute '{name}' is read-only")]
    ReadOnly { name: String },

    #[error("Attribute '{name}' is reserved for internal use")]
    Reserved { name: String },

    #[error("Credential attribute '{name}' cannot be set through {origin}")]
    UntrustedCredential { name: String, origin: String },

    #[error("Invalid value for attribute '{name}': expected {expected}, got '{value}'")]
    InvalidValue {
        name: String,
        expected: String,
        value: String,
    },

    #[error("Value '{value}' not allowed for attribute '{name}' (allowed: {allowed})")]
    NotAllowed {
        name: String,
        value: String,
        allowed: String,
    },

    #[error("Resource {guid} is in terminal state {state}")]
    TerminalState { guid: Guid, state: ResourceState },
}

/// Time specification parsing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeSpecError {
    #[error("Invalid time specification '{input}': {reason}")]
    Invalid { input: String, reason: String },

    #[error("Delay of {delay:?} is too far in the future")]
    OutOfRange { delay: Duration },
}

/// Experiment design validation and I/O errors
#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Design references unknown resource {guid}")]
    UnknownGuid { guid: Guid },

    #[error("Design references unknown resource name '{name}'")]
    UnknownName { name: String },

    #[error("Duplicate resource name '{name}'")]
    DuplicateName { name: String },

    #[error("Resource {guid} cannot be connected to itself")]
    SelfConnection { guid: Guid },

    #[error("Invalid condition: {reason}")]
    InvalidCondition { reason: String },

    #[error("JSON5 parse error: {0}")]
    Json5(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker pool errors
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Worker pool is not accepting new work")]
    Closed,

    #[error("Job was discarded before it started")]
    Discarded,

    #[error("Job failed: {message}")]
    JobFailed { message: String },

    #[error("Job panicked: {message}")]
    JobPanicked { message: String },
}

/// Errors surfaced by the experiment controller API
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Unknown resource {guid}")]
    UnknownGuid { guid: Guid },

    #[error("Unknown resource type '{rtype}'")]
    UnknownType { rtype: String },

    #[error("Resource type '{rtype}' is already registered")]
    DuplicateType { rtype: String },

    #[error("Resources {a} ({a_type}) and {b} ({b_type}) cannot be connected")]
    IllegalConnection {
        a: Guid,
        a_type: String,
        b: Guid,
        b_type: String,
    },

    #[error("Unknown trace '{name}' for resource {guid}")]
    UnknownTrace { guid: Guid, name: String },

    #[error("Cannot {action} resource {guid} in state {state}")]
    InvalidTransition {
        guid: Guid,
        action: ResourceAction,
        state: ResourceState,
    },

    #[error("Driver error on resource {guid}: {message}")]
    Driver { guid: Guid, message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Time specification error: {0}")]
    TimeSpec(#[from] TimeSpecError),

    #[error("Design error: {0}")]
    Design(#[from] DesignError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Experiment aborted: {reason}")]
    Aborted { reason: String },

    #[error("Timed out waiting for resources {guids:?} to reach {state}")]
    WaitTimeout {
        guids: Vec<Guid>,
        state: ResourceState,
    },

    #[error("Experiment controller has been shut down")]
    ShutDown,
}

/// Result type aliases for convenience
pub type ControllerResult<T> = Result<T, ControllerError>;
pub type PoolResult<T> = Result<T, PoolError>;
pub type DesignResult<T> = Result<T, DesignError>;
