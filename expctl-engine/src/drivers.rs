//! Built-in `dummy::*` resource types.
//!
//! These drivers talk to no backend. They reproduce the dependency shapes of
//! real testbeds (an application waits for its node, a node finishes its
//! deployment only once its interfaces are up, interfaces wait for the node
//! to be provisioned and for their link) so designs can be exercised and
//! benchmarked without any infrastructure. Every type has a `latency`
//! attribute that each hook sleeps for.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::handles::BackendHandle;
use crate::resource::{Driver, HookContext, ResourceType, TypeRegistry};
use crate::utils::retry_blocking;
use expctl_shared::errors::ControllerResult;
use expctl_shared::{AttrType, AttributeSpec, Flags, ResourceAction, ResourceState};

pub const NODE: &str = "dummy::Node";
pub const INTERFACE: &str = "dummy::Interface";
pub const LINK: &str = "dummy::Link";
pub const APPLICATION: &str = "dummy::Application";
pub const ERROR_APPLICATION: &str = "dummy::ErrorApplication";

/// Name of the collected output trace of applications
pub const STDOUT_TRACE: &str = "stdout";

fn latency_attribute() -> AttributeSpec {
    AttributeSpec::new("latency", "Time every lifecycle hook takes")
        .with_type(AttrType::Time)
        .with_default("0s")
        .with_flags(Flags::CONSTRUCT)
}

fn simulate(ctx: &HookContext) -> anyhow::Result<()> {
    let latency = ctx.get_duration("latency")?;
    if !latency.is_zero() {
        std::thread::sleep(latency);
    }
    Ok(())
}

/// Login session shared by every node using the same account
#[derive(Debug)]
pub struct Session {
    pub username: String,
}

impl BackendHandle for Session {
    fn teardown(&self) {
        debug!("Closing dummy session of {}", self.username);
    }
}

#[derive(Debug, Default)]
struct Node {
    session: Option<(Vec<String>, Arc<Session>)>,
}

impl Node {
    fn credentials(ctx: &HookContext) -> Option<Vec<String>> {
        let username = ctx.get_str("username")?;
        let password = ctx.get_str("password").unwrap_or_default();
        Some(vec![
            "dummy".to_string(),
            username.to_string(),
            password.to_string(),
        ])
    }
}

impl Driver for Node {
    fn do_discover(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        let unreachable_for = ctx.get_i64("unreachable_attempts").unwrap_or(0);
        let hostname = ctx.get_str("hostname").unwrap_or("localhost").to_string();

        retry_blocking(
            |attempt| {
                simulate(ctx)?;
                if i64::from(attempt) <= unreachable_for {
                    anyhow::bail!("host {} unreachable", hostname)
                }
                Ok(())
            },
            3,
            Duration::from_millis(10),
            2.0,
            "discover",
        )?;

        if let Some(parts) = Self::credentials(ctx) {
            let username = parts[1].clone();
            let session = ctx
                .handles()
                .acquire(&parts, || Ok(Session { username }))?;
            self.session = Some((parts, session));
        }
        Ok(())
    }

    fn do_provision(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)?;
        let address = format!("10.0.{}.{}", ctx.guid().value() / 250, ctx.guid().value() % 250 + 1);
        ctx.update("address", address);
        Ok(())
    }

    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)
    }

    fn do_release(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        if let Some((parts, _session)) = self.session.take() {
            ctx.handles().release(&parts);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Interface;

impl Driver for Interface {
    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)?;
        let node = ctx
            .connected(NODE)
            .next()
            .map(|n| n.guid)
            .ok_or_else(|| anyhow::anyhow!("interface {} is not attached to a node", ctx.guid()))?;
        ctx.update("device", format!("eth-{}-{}", node, ctx.guid()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Link;

impl Driver for Link {
    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)
    }
}

#[derive(Debug, Default)]
struct Application {
    stdout: String,
}

impl Application {
    fn record(&mut self, ctx: &HookContext, line: String) {
        if ctx.trace_enabled(STDOUT_TRACE) {
            self.stdout.push_str(&line);
            self.stdout.push('\n');
        }
    }
}

impl Driver for Application {
    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)?;
        let host = ctx
            .connected(NODE)
            .next()
            .map(|n| n.guid)
            .ok_or_else(|| anyhow::anyhow!("application {} has no node", ctx.guid()))?;
        self.record(ctx, format!("# deployed on node {}", host));
        Ok(())
    }

    fn do_start(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)?;
        let command = ctx.get_str("command").unwrap_or("true").to_string();
        self.record(ctx, format!("$ {}", command));

        if ctx.get("duration").is_some() {
            let duration = ctx.get_duration("duration")?;
            ctx.request(ResourceAction::Stop, duration);
        }
        Ok(())
    }

    fn do_stop(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)?;
        self.record(ctx, "# exited with status 0".to_string());
        ctx.update("exit_code", 0i64);
        Ok(())
    }

    fn trace(&mut self, name: &str, ctx: &HookContext) -> anyhow::Result<String> {
        if name != STDOUT_TRACE || !ctx.trace_enabled(name) {
            anyhow::bail!("trace '{}' was not enabled on application {}", name, ctx.guid());
        }
        Ok(self.stdout.clone())
    }
}

#[derive(Debug, Default)]
struct ErrorApplication;

impl Driver for ErrorApplication {
    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        simulate(ctx)?;
        anyhow::bail!("deployment of {} failed on purpose", ctx.guid())
    }
}

/// Descriptors of every dummy type
pub fn dummy_types() -> Vec<ResourceType> {
    vec![
        ResourceType::new(NODE, Node::default)
            .with_help("Simulated host")
            .with_backend("dummy")
            .with_attribute(latency_attribute())
            .with_attribute(AttributeSpec::new("hostname", "Host name").with_flags(Flags::DESIGN))
            .with_attribute(AttributeSpec::new("username", "Login account"))
            .with_attribute(
                AttributeSpec::new("password", "Login password").with_flags(Flags::CREDENTIAL),
            )
            .with_attribute(
                AttributeSpec::new("unreachable_attempts", "Discovery attempts that fail before the host answers")
                    .with_type(AttrType::Integer)
                    .with_default(0i64)
                    .with_flags(Flags::DESIGN),
            )
            .with_attribute(
                AttributeSpec::new("address", "Address assigned at provisioning")
                    .with_flags(Flags::NO_WRITE),
            )
            .allow_neighbor(INTERFACE)
            .allow_neighbor(APPLICATION)
            .allow_neighbor(ERROR_APPLICATION)
            .requires(INTERFACE, ResourceAction::Deploy, ResourceState::Ready),
        ResourceType::new(INTERFACE, || Interface)
            .with_help("Simulated network interface")
            .with_backend("dummy")
            .with_attribute(latency_attribute())
            .with_attribute(
                AttributeSpec::new("device", "Device name").with_flags(Flags::NO_WRITE),
            )
            .allow_neighbor(NODE)
            .allow_neighbor(LINK)
            .requires(NODE, ResourceAction::Deploy, ResourceState::Provisioned)
            .requires(LINK, ResourceAction::Deploy, ResourceState::Ready),
        ResourceType::new(LINK, || Link)
            .with_help("Simulated link between interfaces")
            .with_backend("dummy")
            .with_attribute(latency_attribute())
            .with_attribute(AttributeSpec::new("delay", "Link delay").with_type(AttrType::Time))
            .allow_neighbor(INTERFACE),
        ResourceType::new(APPLICATION, Application::default)
            .with_help("Simulated application")
            .with_backend("dummy")
            .with_attribute(latency_attribute())
            .with_attribute(
                AttributeSpec::new("command", "Command to run")
                    .with_default("true")
                    .with_flags(Flags::DESIGN),
            )
            .with_attribute(
                AttributeSpec::new("duration", "Run time before the application stops itself")
                    .with_type(AttrType::Time),
            )
            .with_attribute(
                AttributeSpec::new("exit_code", "Exit status")
                    .with_type(AttrType::Integer)
                    .with_flags(Flags::NO_WRITE),
            )
            .with_trace(STDOUT_TRACE, "Standard output")
            .allow_neighbor(NODE)
            .requires(NODE, ResourceAction::Deploy, ResourceState::Ready),
        ResourceType::new(ERROR_APPLICATION, || ErrorApplication)
            .with_help("Application whose deployment always fails")
            .with_backend("dummy")
            .with_attribute(latency_attribute())
            .allow_neighbor(NODE)
            .requires(NODE, ResourceAction::Deploy, ResourceState::Ready),
    ]
}

/// Add the dummy types to `registry`
pub fn register_dummy_types(registry: &mut TypeRegistry) -> ControllerResult<()> {
    for rtype in dummy_types() {
        registry.register(rtype)?;
    }
    Ok(())
}

/// Registry holding only the dummy types
pub fn dummy_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    if let Err(e) = register_dummy_types(&mut registry) {
        error!("Dummy types could not be registered: {}", e);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::SharedHandles;
    use crate::resource::Neighbor;
    use expctl_shared::{AttrValue, Guid};
    use std::collections::{BTreeMap, BTreeSet};

    fn context(guid: u64, rtype: &str, handles: Arc<SharedHandles>) -> HookContext {
        HookContext::new(Guid(guid), rtype, "exp-test", handles)
    }

    #[test]
    fn test_registry_has_every_type() {
        let registry = dummy_registry();
        for rtype in [NODE, INTERFACE, LINK, APPLICATION, ERROR_APPLICATION] {
            assert!(registry.contains(rtype), "{} missing", rtype);
        }
        assert!(register_dummy_types(&mut dummy_registry()).is_err());
    }

    #[test]
    fn test_node_discovery_retries() {
        let handles = Arc::new(SharedHandles::new());
        let mut attributes = BTreeMap::new();
        attributes.insert("unreachable_attempts".to_string(), AttrValue::Integer(2));
        let mut ctx = context(1, NODE, handles.clone()).with_attributes(attributes.clone());
        assert!(Node::default().do_discover(&mut ctx).is_ok());

        attributes.insert("unreachable_attempts".to_string(), AttrValue::Integer(3));
        let mut ctx = context(1, NODE, handles).with_attributes(attributes);
        let err = Node::default().do_discover(&mut ctx).unwrap_err();
        assert!(format!("{:#}", err).contains("unreachable"));
    }

    #[test]
    fn test_nodes_share_session() {
        let handles = Arc::new(SharedHandles::new());
        let mut attributes = BTreeMap::new();
        attributes.insert("username".to_string(), AttrValue::from("alice"));
        attributes.insert("password".to_string(), AttrValue::from("secret"));

        let mut first = Node::default();
        let mut second = Node::default();
        let mut ctx1 = context(1, NODE, handles.clone()).with_attributes(attributes.clone());
        let mut ctx2 = context(2, NODE, handles.clone()).with_attributes(attributes);
        first.do_discover(&mut ctx1).unwrap();
        second.do_discover(&mut ctx2).unwrap();

        let parts = ["dummy", "alice", "secret"];
        assert_eq!(handles.len(), 1);
        assert_eq!(handles.holders(&parts), 2);

        first.do_release(&mut ctx1).unwrap();
        assert_eq!(handles.holders(&parts), 1);
        second.do_release(&mut ctx2).unwrap();
        assert!(handles.is_empty());
    }

    #[test]
    fn test_application_trace_and_self_stop() {
        let handles = Arc::new(SharedHandles::new());
        let mut attributes = BTreeMap::new();
        attributes.insert("command".to_string(), AttrValue::from("ping -c1 node"));
        attributes.insert("duration".to_string(), AttrValue::from("2s"));
        let mut ctx = context(3, APPLICATION, handles)
            .with_attributes(attributes)
            .with_neighbors(vec![Neighbor {
                guid: Guid(1),
                rtype: NODE.to_string(),
                state: ResourceState::Ready,
            }])
            .with_traces(BTreeSet::from([STDOUT_TRACE.to_string()]));

        let mut app = Application::default();
        app.do_deploy(&mut ctx).unwrap();
        app.do_start(&mut ctx).unwrap();

        assert_eq!(
            ctx.take_requests(),
            vec![(ResourceAction::Stop, Duration::from_secs(2))]
        );
        let stdout = app.trace(STDOUT_TRACE, &ctx).unwrap();
        assert!(stdout.contains("deployed on node 1"));
        assert!(stdout.contains("$ ping -c1 node"));
        assert!(app.trace("stderr", &ctx).is_err());
    }

    #[test]
    fn test_error_application_fails() {
        let mut ctx = context(4, ERROR_APPLICATION, Arc::new(SharedHandles::new()));
        assert!(ErrorApplication.do_deploy(&mut ctx).is_err());
    }
}
