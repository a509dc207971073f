//! Resource managers.
//!
//! A [`ResourceManager`] is the controller-side record of one resource: its
//! attribute values, lifecycle state, connections and the driver that does the
//! backend work. Managers are owned by the dispatch loop and mutated only
//! there. At most one lifecycle step per resource is in flight at any time.

pub mod driver;
pub mod registry;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

use expctl_shared::errors::ValidationError;
use expctl_shared::{AttrValue, Attribute, Flags, Guid, ResourceAction, ResourceState, WriteOrigin};

pub use driver::{Driver, HookContext, Neighbor};
pub use registry::{
    CRITICAL_ATTRIBUTE, DriverFactory, Requirement, ResourceType, TraceSpec, TypeRegistry,
};

/// Driver shared between the dispatch loop and the worker running its hook
pub type SharedDriver = Arc<Mutex<Box<dyn Driver>>>;

/// One lifecycle step, backed by one driver hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Discover,
    Provision,
    Deploy,
    Start,
    Stop,
    Release,
}

impl Step {
    /// State reached when the hook succeeds
    pub fn target(self) -> ResourceState {
        match self {
            Step::Discover => ResourceState::Discovered,
            Step::Provision => ResourceState::Provisioned,
            Step::Deploy => ResourceState::Ready,
            Step::Start => ResourceState::Started,
            Step::Stop => ResourceState::Stopped,
            Step::Release => ResourceState::Released,
        }
    }

    /// State the resource must be in for the step to run.
    ///
    /// Release runs from any state and has no fixed source.
    pub fn source(self) -> Option<ResourceState> {
        match self {
            Step::Discover => Some(ResourceState::New),
            Step::Provision => Some(ResourceState::Discovered),
            Step::Deploy => Some(ResourceState::Provisioned),
            Step::Start => Some(ResourceState::Ready),
            Step::Stop => Some(ResourceState::Started),
            Step::Release => None,
        }
    }

    /// Action whose conditions gate this step.
    ///
    /// DEPLOY conditions hold the whole deployment back, so they gate the
    /// first step. The final deploy step is gated by requirements only.
    pub fn condition_action(self) -> Option<ResourceAction> {
        match self {
            Step::Discover => Some(ResourceAction::Deploy),
            Step::Provision => Some(ResourceAction::Provision),
            Step::Deploy => None,
            Step::Start => Some(ResourceAction::Start),
            Step::Stop => Some(ResourceAction::Stop),
            Step::Release => Some(ResourceAction::Release),
        }
    }

    /// Action whose type requirements gate this step
    pub fn requirement_action(self) -> Option<ResourceAction> {
        match self {
            Step::Discover => None,
            Step::Provision => Some(ResourceAction::Provision),
            Step::Deploy => Some(ResourceAction::Deploy),
            Step::Start => Some(ResourceAction::Start),
            Step::Stop => Some(ResourceAction::Stop),
            Step::Release => Some(ResourceAction::Release),
        }
    }

    /// Step that a client action starts
    pub fn for_action(action: ResourceAction) -> Option<Step> {
        match action {
            ResourceAction::Deploy => Some(Step::Discover),
            ResourceAction::Provision => Some(Step::Provision),
            ResourceAction::Start => Some(Step::Start),
            ResourceAction::Stop => Some(Step::Stop),
            ResourceAction::Release => Some(Step::Release),
            ResourceAction::Set => None,
        }
    }

    /// Steps that take a resource from `from` up to `goal`
    pub fn path(from: ResourceState, goal: ResourceState) -> Vec<Step> {
        const FORWARD: [Step; 5] = [
            Step::Discover,
            Step::Provision,
            Step::Deploy,
            Step::Start,
            Step::Stop,
        ];
        if goal == ResourceState::Released {
            return vec![Step::Release];
        }
        FORWARD
            .into_iter()
            .filter(|step| {
                let target = step.target();
                !from.satisfies(target) && goal.satisfies(target)
            })
            .collect()
    }

    pub fn invoke(self, driver: &mut dyn Driver, ctx: &mut HookContext) -> anyhow::Result<()> {
        match self {
            Step::Discover => driver.do_discover(ctx),
            Step::Provision => driver.do_provision(ctx),
            Step::Deploy => driver.do_deploy(ctx),
            Step::Start => driver.do_start(ctx),
            Step::Stop => driver.do_stop(ctx),
            Step::Release => driver.do_release(ctx),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Discover => "discover",
            Step::Provision => "provision",
            Step::Deploy => "deploy",
            Step::Start => "start",
            Step::Stop => "stop",
            Step::Release => "release",
        };
        f.write_str(name)
    }
}

fn timestamp_key(state: ResourceState) -> &'static str {
    match state {
        ResourceState::New => "register_time",
        ResourceState::Discovered => "discover_time",
        ResourceState::Provisioned => "provision_time",
        ResourceState::Ready => "ready_time",
        ResourceState::Started => "start_time",
        ResourceState::Stopped => "stop_time",
        ResourceState::Failed => "failed_time",
        ResourceState::Released => "release_time",
    }
}

/// Client-facing snapshot of a resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    pub guid: Guid,
    pub rtype: String,
    pub state: ResourceState,
    pub critical: bool,
    /// Public attribute values; credentials are masked
    pub attributes: BTreeMap<String, String>,
    pub connections: Vec<Guid>,
    pub traces: Vec<String>,
    pub last_error: Option<String>,
    /// Seconds since registration at which each state was reached,
    /// keyed `discover_time`, `ready_time`, `start_time` and so on
    pub timestamps: BTreeMap<String, f64>,
}

pub struct ResourceManager {
    guid: Guid,
    rtype: Arc<ResourceType>,
    attributes: BTreeMap<String, Attribute>,
    state: ResourceState,
    connections: BTreeSet<Guid>,
    driver: SharedDriver,
    in_flight: Option<Step>,
    registered_at: Instant,
    reached: HashMap<ResourceState, Instant>,
    traces: BTreeSet<String>,
    group: Option<usize>,
    last_error: Option<String>,
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("guid", &self.guid)
            .field("rtype", &self.rtype.rtype)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl ResourceManager {
    pub fn new(guid: Guid, rtype: Arc<ResourceType>) -> Self {
        let attributes = rtype
            .attributes()
            .iter()
            .map(|spec| (spec.name.clone(), Attribute::new(Arc::clone(spec))))
            .collect();
        let driver = Arc::new(Mutex::new(rtype.create_driver()));
        let now = Instant::now();
        let mut reached = HashMap::new();
        reached.insert(ResourceState::New, now);

        Self {
            guid,
            rtype,
            attributes,
            state: ResourceState::New,
            connections: BTreeSet::new(),
            driver,
            in_flight: None,
            registered_at: now,
            reached,
            traces: BTreeSet::new(),
            group: None,
            last_error: None,
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn rtype(&self) -> &str {
        &self.rtype.rtype
    }

    pub fn resource_type(&self) -> &Arc<ResourceType> {
        &self.rtype
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn driver(&self) -> SharedDriver {
        Arc::clone(&self.driver)
    }

    fn attribute_mut(&mut self, name: &str) -> Result<&mut Attribute, ValidationError> {
        let rtype = self.rtype.rtype.clone();
        self.attributes
            .get_mut(name)
            .ok_or_else(|| ValidationError::UnknownAttribute {
                rtype,
                name: name.to_string(),
            })
    }

    /// Write an attribute through `origin`
    pub fn set(
        &mut self,
        name: &str,
        value: AttrValue,
        origin: WriteOrigin,
    ) -> Result<(), ValidationError> {
        let guid = self.guid;
        let state = self.state;
        let attribute = self.attribute_mut(name)?;
        attribute.set(guid, state, origin, value)?;
        debug!("Resource {} attribute {} = {}", guid, name, attribute.display_value());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<AttrValue>, ValidationError> {
        self.attributes
            .get(name)
            .map(|a| a.value().cloned())
            .ok_or_else(|| ValidationError::UnknownAttribute {
                rtype: self.rtype.rtype.clone(),
                name: name.to_string(),
            })
    }

    /// Attribute values explicitly differing from the type defaults
    pub fn modified_attributes(&self) -> BTreeMap<String, AttrValue> {
        self.attributes
            .iter()
            .filter(|(_, a)| !a.has_flag(Flags::RESERVED))
            .filter_map(|(name, a)| match a.value() {
                Some(v) if Some(v) != a.spec().default.as_ref() => Some((name.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Every set attribute value, credentials included, for driver hooks
    pub fn attribute_values(&self) -> BTreeMap<String, AttrValue> {
        self.attributes
            .iter()
            .filter_map(|(name, a)| a.value().map(|v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn is_critical(&self) -> bool {
        self.attributes
            .get(CRITICAL_ATTRIBUTE)
            .and_then(|a| a.value())
            .and_then(AttrValue::as_bool)
            .unwrap_or(true)
    }

    pub fn connect(&mut self, other: Guid) {
        self.connections.insert(other);
    }

    pub fn connections(&self) -> &BTreeSet<Guid> {
        &self.connections
    }

    pub fn enable_trace(&mut self, name: &str) -> bool {
        if !self.rtype.has_trace(name) {
            return false;
        }
        self.traces.insert(name.to_string());
        true
    }

    pub fn enabled_traces(&self) -> &BTreeSet<String> {
        &self.traces
    }

    pub fn group(&self) -> Option<usize> {
        self.group
    }

    pub fn set_group(&mut self, group: usize) {
        self.group = Some(group);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn begin(&mut self, step: Step) {
        debug!("Resource {} ({}) begins {}", self.guid, self.rtype.rtype, step);
        self.in_flight = Some(step);
    }

    pub fn end(&mut self) {
        self.in_flight = None;
    }

    /// Move to `state` and stamp the time it was reached
    pub fn set_state(&mut self, state: ResourceState) {
        if self.state == state {
            return;
        }
        info!(
            "Resource {} ({}) {} -> {}",
            self.guid, self.rtype.rtype, self.state, state
        );
        self.state = state;
        self.reached.entry(state).or_insert_with(Instant::now);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.set_state(ResourceState::Failed);
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Moment this resource first satisfied `required`
    pub fn reached_at(&self, required: ResourceState) -> Option<Instant> {
        self.reached
            .iter()
            .filter(|(state, _)| state.satisfies(required))
            .map(|(_, at)| *at)
            .min()
    }

    pub fn info(&self) -> ResourceInfo {
        let attributes = self
            .attributes
            .iter()
            .filter(|(_, a)| !a.has_flag(Flags::RESERVED))
            .map(|(name, a)| (name.clone(), a.display_value()))
            .collect();

        let timestamps = self
            .reached
            .iter()
            .map(|(state, at)| {
                (
                    timestamp_key(*state).to_string(),
                    at.duration_since(self.registered_at).as_secs_f64(),
                )
            })
            .collect();

        ResourceInfo {
            guid: self.guid,
            rtype: self.rtype.rtype.clone(),
            state: self.state,
            critical: self.is_critical(),
            attributes,
            connections: self.connections.iter().copied().collect(),
            traces: self.traces.iter().cloned().collect(),
            last_error: self.last_error.clone(),
            timestamps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expctl_shared::{AttrType, AttributeSpec};

    struct Noop;
    impl Driver for Noop {}

    fn manager() -> ResourceManager {
        let rtype = ResourceType::new("test::Node", || Noop)
            .with_attribute(AttributeSpec::new("hostname", "Host").with_flags(Flags::DESIGN))
            .with_attribute(
                AttributeSpec::new("password", "Password").with_flags(Flags::CREDENTIAL),
            )
            .with_attribute(
                AttributeSpec::new("cores", "CPU cores")
                    .with_type(AttrType::Integer)
                    .with_default(1i64),
            )
            .with_trace("syslog", "System log");
        ResourceManager::new(Guid(1), Arc::new(rtype))
    }

    #[test]
    fn test_step_path() {
        assert_eq!(
            Step::path(ResourceState::New, ResourceState::Started),
            vec![Step::Discover, Step::Provision, Step::Deploy, Step::Start]
        );
        assert_eq!(
            Step::path(ResourceState::Ready, ResourceState::Stopped),
            vec![Step::Start, Step::Stop]
        );
        assert!(Step::path(ResourceState::Started, ResourceState::Ready).is_empty());
        assert_eq!(
            Step::path(ResourceState::Started, ResourceState::Released),
            vec![Step::Release]
        );
    }

    #[test]
    fn test_state_timestamps() {
        let mut rm = manager();
        assert!(rm.reached_at(ResourceState::Ready).is_none());
        rm.set_state(ResourceState::Discovered);
        rm.set_state(ResourceState::Provisioned);
        rm.set_state(ResourceState::Ready);
        rm.set_state(ResourceState::Started);

        let ready = rm.reached_at(ResourceState::Ready).unwrap();
        let started = rm.reached_at(ResourceState::Started).unwrap();
        assert!(ready <= started);
        assert!(rm.info().timestamps.contains_key("start_time"));
    }

    #[test]
    fn test_design_attribute_locked_after_new() {
        let mut rm = manager();
        rm.set("hostname", "node1".into(), WriteOrigin::Client).unwrap();
        rm.set_state(ResourceState::Discovered);
        assert!(matches!(
            rm.set("hostname", "node2".into(), WriteOrigin::Client),
            Err(ValidationError::DesignOnly { .. })
        ));
        assert_eq!(rm.get("hostname").unwrap(), Some(AttrValue::from("node1")));
    }

    #[test]
    fn test_unknown_attribute() {
        let rm = manager();
        assert!(matches!(
            rm.get("nonexistent"),
            Err(ValidationError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_info_masks_credentials() {
        let mut rm = manager();
        rm.set("password", "hunter2".into(), WriteOrigin::Client).unwrap();
        let info = rm.info();
        assert_eq!(info.attributes.get("password").map(String::as_str), Some("***"));
        assert_eq!(rm.attribute_values().get("password"), Some(&AttrValue::from("hunter2")));
    }

    #[test]
    fn test_modified_attributes_skip_defaults() {
        let mut rm = manager();
        rm.set("hostname", "node1".into(), WriteOrigin::Client).unwrap();
        let modified = rm.modified_attributes();
        assert!(modified.contains_key("hostname"));
        assert!(!modified.contains_key("cores"));
        assert!(!modified.contains_key(CRITICAL_ATTRIBUTE));
    }

    #[test]
    fn test_critical_flag() {
        let mut rm = manager();
        assert!(rm.is_critical());
        rm.set(CRITICAL_ATTRIBUTE, false.into(), WriteOrigin::Client).unwrap();
        assert!(!rm.is_critical());
    }

    #[test]
    fn test_traces_must_be_declared() {
        let mut rm = manager();
        assert!(rm.enable_trace("syslog"));
        assert!(!rm.enable_trace("pcap"));
        assert_eq!(rm.enabled_traces().len(), 1);
    }
}
