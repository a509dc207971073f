//! Shared data model for the expctl experiment controller.
//!
//! This crate contains the plain data structures used by the execution engine
//! and by anything that builds or inspects experiments: resource identifiers,
//! the lifecycle states and actions, attribute schemas, time specifications,
//! declarative conditions and the serializable experiment design.
//!
//! # Key Components
//!
//! * [`Guid`] - Per-controller resource identifier
//! * [`ResourceState`] - Ordered lifecycle states of a resource
//! * [`ResourceAction`] - Actions the controller issues on resources
//! * [`Condition`] - Ordering/timing constraint between resources
//! * [`attributes`] - Attribute schema, values and write checks
//! * [`time_spec`] - Relative/absolute time specifications ("2s", "500ms")
//! * [`design`] - Serializable experiment design
//! * [`design_json`] - JSON5 design files with named resources
//!
//! # Lifecycle
//!
//! ```text
//! NEW ─► DISCOVERED ─► PROVISIONED ─► READY ─► STARTED ─► STOPPED
//!  │          │              │          │         │          │
//!  └──────────┴──────────────┴──── FAILED ◄───────┘          │
//!                                                            ▼
//!                     (any state) ──────────────────────► RELEASED
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod attributes;
pub mod design;
pub mod design_json;
pub mod errors;
pub mod time_spec;

pub use attributes::{AttrType, AttrValue, Attribute, AttributeSpec, Flags, WriteOrigin};
pub use design::ExperimentDesign;
pub use errors::{ControllerError, DesignError, PoolError, TimeSpecError, ValidationError};
pub use time_spec::TimeSpec;

/// Opaque resource identifier, unique within one controller.
///
/// Guids are assigned at registration, grow monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(pub u64);

impl Guid {
    /// Raw numeric value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Guid {
    fn from(value: u64) -> Self {
        Guid(value)
    }
}

/// Lifecycle state of a resource.
///
/// The forward states are totally ordered (`NEW < DISCOVERED < PROVISIONED <
/// READY < STARTED < STOPPED`). `FAILED` and `RELEASED` sit outside that order
/// and never satisfy a forward-progress requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    New,
    Discovered,
    Provisioned,
    Ready,
    Started,
    Stopped,
    Failed,
    Released,
}

impl ResourceState {
    /// Position in the forward lifecycle, `None` for FAILED and RELEASED
    pub fn progress_rank(self) -> Option<u8> {
        match self {
            ResourceState::New => Some(0),
            ResourceState::Discovered => Some(1),
            ResourceState::Provisioned => Some(2),
            ResourceState::Ready => Some(3),
            ResourceState::Started => Some(4),
            ResourceState::Stopped => Some(5),
            ResourceState::Failed | ResourceState::Released => None,
        }
    }

    /// Whether a resource in this state fulfils a requirement on `required`.
    ///
    /// Forward states compare by rank. FAILED and RELEASED only satisfy a
    /// requirement that names them exactly.
    pub fn satisfies(self, required: ResourceState) -> bool {
        if self == required {
            return true;
        }
        match (self.progress_rank(), required.progress_rank()) {
            (Some(current), Some(wanted)) => current >= wanted,
            _ => false,
        }
    }

    /// True once the resource can make no further forward progress
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ResourceState::Stopped | ResourceState::Failed | ResourceState::Released
        )
    }

    /// True for FAILED and RELEASED
    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Failed | ResourceState::Released)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::New => "NEW",
            ResourceState::Discovered => "DISCOVERED",
            ResourceState::Provisioned => "PROVISIONED",
            ResourceState::Ready => "READY",
            ResourceState::Started => "STARTED",
            ResourceState::Stopped => "STOPPED",
            ResourceState::Failed => "FAILED",
            ResourceState::Released => "RELEASED",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(ResourceState::New),
            "discovered" => Ok(ResourceState::Discovered),
            "provisioned" => Ok(ResourceState::Provisioned),
            "ready" => Ok(ResourceState::Ready),
            "started" => Ok(ResourceState::Started),
            "stopped" => Ok(ResourceState::Stopped),
            "failed" => Ok(ResourceState::Failed),
            "released" => Ok(ResourceState::Released),
            other => Err(format!("Unknown resource state '{}'", other)),
        }
    }
}

/// Action the controller issues on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
    Deploy,
    Provision,
    Start,
    Stop,
    Set,
    Release,
}

impl ResourceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceAction::Deploy => "DEPLOY",
            ResourceAction::Provision => "PROVISION",
            ResourceAction::Start => "START",
            ResourceAction::Stop => "STOP",
            ResourceAction::Set => "SET",
            ResourceAction::Release => "RELEASE",
        }
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deploy" => Ok(ResourceAction::Deploy),
            "provision" => Ok(ResourceAction::Provision),
            "start" => Ok(ResourceAction::Start),
            "stop" => Ok(ResourceAction::Stop),
            "set" => Ok(ResourceAction::Set),
            "release" => Ok(ResourceAction::Release),
            other => Err(format!("Unknown resource action '{}'", other)),
        }
    }
}

/// Declarative constraint gating `action` on every subject.
///
/// The action may run on a subject only once every target has reached at
/// least `state`; `delay` is added after the moment the last target got there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub subjects: BTreeSet<Guid>,
    pub action: ResourceAction,
    pub targets: BTreeSet<Guid>,
    pub state: ResourceState,
    #[serde(default, with = "time_spec::serde_opt_duration")]
    pub delay: Option<Duration>,
}

impl Condition {
    pub fn new(
        subjects: impl IntoIterator<Item = Guid>,
        action: ResourceAction,
        targets: impl IntoIterator<Item = Guid>,
        state: ResourceState,
    ) -> Self {
        Self {
            subjects: subjects.into_iter().collect(),
            action,
            targets: targets.into_iter().collect(),
            state,
            delay: None,
        }
    }

    /// Add an extra delay applied after all targets reached the state
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Whether this condition gates `action` on `guid`
    pub fn applies_to(&self, guid: Guid, action: ResourceAction) -> bool {
        self.action == action && self.subjects.contains(&guid)
    }
}
