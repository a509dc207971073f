//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use expctl_engine::config::ControllerConfig;
use expctl_engine::drivers::register_dummy_types;
use expctl_engine::{Driver, HookContext, ResourceType, TypeRegistry};
use expctl_shared::{AttrType, AttributeSpec, Flags, Guid, ResourceAction, ResourceState};

pub const HOST: &str = "test::Host";
pub const SERVICE: &str = "test::Service";

/// Short delays so tests finish quickly, and a timeout so they never hang
pub fn fast_config() -> ControllerConfig {
    ControllerConfig::default()
        .with_reschedule_delay(Duration::from_millis(20))
        .with_poll_interval(Duration::from_millis(10))
        .with_wait_timeout(Duration::from_secs(15))
        .with_max_workers(4)
}

/// Ordered record of hook activity across all recorder drivers
#[derive(Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<(Instant, String)>>>,
}

impl Journal {
    pub fn record(&self, event: String) {
        self.events.lock().unwrap().push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn time_of(&self, event: &str) -> Option<Instant> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, e)| e == event)
            .map(|(at, _)| *at)
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

pub fn event(phase: &str, hook: &str, guid: Guid) -> String {
    format!("{} {} {}", phase, hook, guid)
}

/// Driver that journals every hook and can be told to fail one of them
pub struct Recorder {
    journal: Journal,
}

impl Recorder {
    fn hook(&self, name: &str, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.journal.record(event("begin", name, ctx.guid()));
        std::thread::sleep(ctx.get_duration("latency")?);
        if ctx.get_str("fail_on") == Some(name) {
            anyhow::bail!("{} failed as requested", name);
        }
        self.journal.record(event("end", name, ctx.guid()));
        Ok(())
    }
}

impl Driver for Recorder {
    fn do_discover(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.hook("discover", ctx)
    }

    fn do_provision(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.hook("provision", ctx)
    }

    fn do_deploy(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.hook("deploy", ctx)
    }

    fn do_start(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.hook("start", ctx)
    }

    fn do_stop(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.hook("stop", ctx)
    }

    fn do_release(&mut self, ctx: &mut HookContext) -> anyhow::Result<()> {
        self.hook("release", ctx)
    }
}

fn recorder_type(rtype: &str, journal: &Journal) -> ResourceType {
    let journal = journal.clone();
    ResourceType::new(rtype, move || Recorder {
        journal: journal.clone(),
    })
    .with_attribute(
        AttributeSpec::new("latency", "Time each hook takes")
            .with_type(AttrType::Time)
            .with_default("0s")
            .with_flags(Flags::CONSTRUCT),
    )
    .with_attribute(AttributeSpec::new("fail_on", "Hook that fails").with_flags(Flags::DESIGN))
}

/// Recorder host and service types plus the dummy types
pub fn test_registry(journal: &Journal) -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register(recorder_type(HOST, journal)).unwrap();
    registry
        .register(
            recorder_type(SERVICE, journal)
                .allow_neighbor(HOST)
                .requires(HOST, ResourceAction::Deploy, ResourceState::Ready),
        )
        .unwrap();
    register_dummy_types(&mut registry).unwrap();
    registry
}
