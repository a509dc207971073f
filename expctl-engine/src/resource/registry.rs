//! Resource type descriptors and the per-controller type registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::driver::Driver;
use expctl_shared::errors::{ControllerError, ControllerResult};
use expctl_shared::{AttrType, AttributeSpec, Flags, ResourceAction, ResourceState};

/// Name of the attribute every resource type carries
pub const CRITICAL_ATTRIBUTE: &str = "critical";

/// Builds a fresh driver for each registered resource
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Type-level dependency: before running `before` on a resource, every
/// connected resource of `neighbor_type` must have reached `state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub neighbor_type: String,
    pub before: ResourceAction,
    pub state: ResourceState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSpec {
    pub name: String,
    pub help: String,
}

/// Descriptor of a resource type
#[derive(Clone)]
pub struct ResourceType {
    pub rtype: String,
    pub help: String,
    pub backend: String,
    attributes: Vec<Arc<AttributeSpec>>,
    traces: Vec<TraceSpec>,
    allowed_neighbors: Option<BTreeSet<String>>,
    requirements: Vec<Requirement>,
    reschedule_delay: Option<Duration>,
    factory: DriverFactory,
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("rtype", &self.rtype)
            .field("backend", &self.backend)
            .field("attributes", &self.attributes.len())
            .field("requirements", &self.requirements)
            .finish()
    }
}

impl ResourceType {
    pub fn new<F, D>(rtype: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: Driver,
    {
        let critical = AttributeSpec::new(
            CRITICAL_ATTRIBUTE,
            "Whether a failure of this resource marks the experiment as failed",
        )
        .with_type(AttrType::Bool)
        .with_default(true)
        .with_flags(Flags::DESIGN);

        Self {
            rtype: rtype.into(),
            help: String::new(),
            backend: String::new(),
            attributes: vec![Arc::new(critical)],
            traces: Vec::new(),
            allowed_neighbors: None,
            requirements: Vec::new(),
            reschedule_delay: None,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Driver>),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Declare an attribute, replacing an earlier one of the same name
    pub fn with_attribute(mut self, spec: AttributeSpec) -> Self {
        self.attributes.retain(|a| a.name != spec.name);
        self.attributes.push(Arc::new(spec));
        self
    }

    pub fn with_trace(mut self, name: impl Into<String>, help: impl Into<String>) -> Self {
        self.traces.push(TraceSpec {
            name: name.into(),
            help: help.into(),
        });
        self
    }

    /// Restrict connections to the listed types. Without any call every type
    /// may be connected.
    pub fn allow_neighbor(mut self, rtype: impl Into<String>) -> Self {
        self.allowed_neighbors
            .get_or_insert_with(BTreeSet::new)
            .insert(rtype.into());
        self
    }

    pub fn requires(
        mut self,
        neighbor_type: impl Into<String>,
        before: ResourceAction,
        state: ResourceState,
    ) -> Self {
        self.requirements.push(Requirement {
            neighbor_type: neighbor_type.into(),
            before,
            state,
        });
        self
    }

    pub fn with_reschedule_delay(mut self, delay: Duration) -> Self {
        self.reschedule_delay = Some(delay);
        self
    }

    pub fn attributes(&self) -> &[Arc<AttributeSpec>] {
        &self.attributes
    }

    /// Attributes visible to clients; reserved ones are hidden
    pub fn public_attributes(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes
            .iter()
            .map(|a| a.as_ref())
            .filter(|a| !a.has_flag(Flags::RESERVED))
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<AttributeSpec>> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn traces(&self) -> &[TraceSpec] {
        &self.traces
    }

    pub fn has_trace(&self, name: &str) -> bool {
        self.traces.iter().any(|t| t.name == name)
    }

    pub fn allows_neighbor(&self, rtype: &str) -> bool {
        self.allowed_neighbors
            .as_ref()
            .is_none_or(|allowed| allowed.contains(rtype))
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn reschedule_delay(&self) -> Option<Duration> {
        self.reschedule_delay
    }

    pub fn create_driver(&self) -> Box<dyn Driver> {
        (self.factory)()
    }
}

/// Resource types known to one controller
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, Arc<ResourceType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rtype: ResourceType) -> ControllerResult<()> {
        if self.types.contains_key(&rtype.rtype) {
            return Err(ControllerError::DuplicateType { rtype: rtype.rtype });
        }
        self.types.insert(rtype.rtype.clone(), Arc::new(rtype));
        Ok(())
    }

    pub fn get(&self, rtype: &str) -> ControllerResult<Arc<ResourceType>> {
        self.types
            .get(rtype)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownType {
                rtype: rtype.to_string(),
            })
    }

    pub fn contains(&self, rtype: &str) -> bool {
        self.types.contains_key(rtype)
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
