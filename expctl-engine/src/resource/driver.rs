//! Backend driver seam.
//!
//! A [`Driver`] performs the real work behind each lifecycle step. Hooks run
//! on the worker pool and may block. They never touch controller state
//! directly: everything a hook needs is copied into a [`HookContext`], and
//! whatever it wants to change (attribute values it learned, follow-up
//! actions) is collected on the context and applied by the dispatch loop once
//! the hook returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::handles::SharedHandles;
use expctl_shared::time_spec::parse_duration;
use expctl_shared::{AttrValue, Guid, ResourceAction, ResourceState};

/// Lifecycle hooks of one resource instance.
///
/// Every hook defaults to a no-op so drivers only implement the steps their
/// backend needs. An `Err` from a hook marks the resource FAILED.
pub trait Driver: Send + 'static {
    fn do_discover(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn do_provision(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn do_start(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn do_stop(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn do_release(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Read the collected output of an enabled trace
    fn trace(&mut self, name: &str, ctx: &HookContext) -> anyhow::Result<String> {
        let _ = ctx;
        anyhow::bail!("trace '{}' is not collected by this driver", name)
    }
}

/// Connected resource as seen by a hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub guid: Guid,
    pub rtype: String,
    pub state: ResourceState,
}

/// Snapshot of a resource handed to its driver hooks
#[derive(Debug, Clone)]
pub struct HookContext {
    guid: Guid,
    rtype: String,
    exp_id: String,
    attributes: BTreeMap<String, AttrValue>,
    neighbors: Vec<Neighbor>,
    traces: BTreeSet<String>,
    handles: Arc<SharedHandles>,
    requests: Vec<(ResourceAction, Duration)>,
    updates: Vec<(String, AttrValue)>,
}

impl HookContext {
    pub fn new(
        guid: Guid,
        rtype: impl Into<String>,
        exp_id: impl Into<String>,
        handles: Arc<SharedHandles>,
    ) -> Self {
        Self {
            guid,
            rtype: rtype.into(),
            exp_id: exp_id.into(),
            attributes: BTreeMap::new(),
            neighbors: Vec::new(),
            traces: BTreeSet::new(),
            handles,
            requests: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, AttrValue>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_neighbors(mut self, neighbors: Vec<Neighbor>) -> Self {
        self.neighbors = neighbors;
        self
    }

    pub fn with_traces(mut self, traces: BTreeSet<String>) -> Self {
        self.traces = traces;
        self
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn rtype(&self) -> &str {
        &self.rtype
    }

    pub fn exp_id(&self) -> &str {
        &self.exp_id
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttrValue::as_i64)
    }

    /// Read a time attribute; unset or empty values mean zero
    pub fn get_duration(&self, name: &str) -> anyhow::Result<Duration> {
        match self.get(name) {
            Some(value) => Ok(parse_duration(&value.to_string())?),
            None => Ok(Duration::ZERO),
        }
    }

    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    /// Connected resources of one type
    pub fn connected<'a>(&'a self, rtype: &'a str) -> impl Iterator<Item = &'a Neighbor> + 'a {
        self.neighbors.iter().filter(move |n| n.rtype == rtype)
    }

    pub fn trace_enabled(&self, name: &str) -> bool {
        self.traces.contains(name)
    }

    pub fn handles(&self) -> &SharedHandles {
        &self.handles
    }

    /// Ask the controller to issue `action` on this resource after `delay`
    pub fn request(&mut self, action: ResourceAction, delay: Duration) {
        self.requests.push((action, delay));
    }

    /// Publish an attribute value learned by the driver.
    ///
    /// Later reads through the context see the new value immediately.
    pub fn update(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        let name = name.into();
        let value = value.into();
        self.attributes.insert(name.clone(), value.clone());
        self.updates.push((name, value));
    }

    pub(crate) fn take_requests(&mut self) -> Vec<(ResourceAction, Duration)> {
        std::mem::take(&mut self.requests)
    }

    pub(crate) fn take_updates(&mut self) -> Vec<(String, AttrValue)> {
        std::mem::take(&mut self.updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HookContext {
        let mut attributes = BTreeMap::new();
        attributes.insert("hostname".to_string(), AttrValue::from("node1"));
        attributes.insert("duration".to_string(), AttrValue::from("0.5s"));
        HookContext::new(Guid(2), "dummy::Application", "exp-1", Arc::new(SharedHandles::new()))
            .with_attributes(attributes)
            .with_neighbors(vec![
                Neighbor {
                    guid: Guid(1),
                    rtype: "dummy::Node".into(),
                    state: ResourceState::Ready,
                },
                Neighbor {
                    guid: Guid(3),
                    rtype: "dummy::Link".into(),
                    state: ResourceState::New,
                },
            ])
    }

    #[test]
    fn test_attribute_access() {
        let ctx = context();
        assert_eq!(ctx.get_str("hostname"), Some("node1"));
        assert_eq!(ctx.get_duration("duration").unwrap(), Duration::from_millis(500));
        assert_eq!(ctx.get_duration("missing").unwrap(), Duration::ZERO);
        assert!(ctx.get_bool("hostname").is_none());
    }

    #[test]
    fn test_connected_filters_by_type() {
        let ctx = context();
        let nodes: Vec<Guid> = ctx.connected("dummy::Node").map(|n| n.guid).collect();
        assert_eq!(nodes, vec![Guid(1)]);
    }

    #[test]
    fn test_updates_and_requests_are_collected() {
        let mut ctx = context();
        ctx.update("pid", 4242i64);
        ctx.request(ResourceAction::Stop, Duration::from_secs(1));

        assert_eq!(ctx.get_i64("pid"), Some(4242));
        assert_eq!(ctx.take_updates(), vec![("pid".to_string(), AttrValue::Integer(4242))]);
        assert_eq!(ctx.take_requests(), vec![(ResourceAction::Stop, Duration::from_secs(1))]);
        assert!(ctx.take_updates().is_empty());
    }

    #[test]
    fn test_default_hooks() {
        struct Noop;
        impl Driver for Noop {}

        let mut ctx = context();
        let mut driver = Noop;
        assert!(driver.do_discover(&mut ctx).is_ok());
        assert!(driver.do_release(&mut ctx).is_ok());
        assert!(driver.trace("stdout", &ctx).is_err());
    }
}
