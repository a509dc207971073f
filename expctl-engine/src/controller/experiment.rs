//! Experiment state owned by the dispatch loop.
//!
//! Everything in here runs on the dispatch task with exclusive access. Blocking
//! driver work is never run inline: it is packaged as a job, collected in
//! `offloads` and handed to the worker pool once the current task returns.
//! Workers report back by scheduling a zero-delay follow-up task, so every
//! state transition happens here.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::WaitReport;
use crate::config::ControllerConfig;
use crate::failure::FailureManager;
use crate::handles::SharedHandles;
use crate::resource::{
    HookContext, Neighbor, ResourceInfo, ResourceManager, SharedDriver, Step, TypeRegistry,
};
use crate::scheduler::{Scheduler, TaskOrigin};
use crate::utils::{lock_unpoisoned, panic_message};
use expctl_shared::design::ResourceDesign;
use expctl_shared::errors::{ControllerError, ControllerResult, ValidationError};
use expctl_shared::{
    AttrValue, Attribute, Condition, ExperimentDesign, Guid, ResourceAction, ResourceState,
    TimeSpec, WriteOrigin,
};

/// Blocking work handed to the worker pool
pub(crate) type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    Wait(Duration),
}

/// Result of one wait poll
#[derive(Debug, Clone, Default)]
pub(crate) struct WaitProbe {
    pub reached: Vec<Guid>,
    pub failed: Vec<Guid>,
    pub pending: Vec<Guid>,
    pub aborted: Option<String>,
}

impl WaitProbe {
    pub fn into_report(self) -> WaitReport {
        WaitReport {
            reached: self.reached,
            failed: self.failed,
        }
    }
}

/// Run a driver hook, turning panics into errors
pub(crate) fn run_hook(driver: &SharedDriver, step: Step, ctx: &mut HookContext) -> anyhow::Result<()> {
    let mut guard = lock_unpoisoned(driver);
    match catch_unwind(AssertUnwindSafe(|| step.invoke(&mut **guard, ctx))) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "driver panicked during {}: {}",
            step,
            panic_message(payload)
        )),
    }
}

/// Whether a resource in `state` counts as having reached `goal` for a wait
fn reaches(state: ResourceState, goal: ResourceState) -> bool {
    state.satisfies(goal) || (goal.is_finished() && state == ResourceState::Released)
}

pub(crate) struct Experiment {
    exp_id: String,
    config: ControllerConfig,
    types: TypeRegistry,
    globals: HashMap<String, BTreeMap<String, AttrValue>>,
    next_guid: u64,
    resources: BTreeMap<Guid, ResourceManager>,
    conditions: Vec<Condition>,
    groups: Vec<Vec<Guid>>,
    pub(crate) failures: FailureManager,
    scheduler: Scheduler<Experiment>,
    handles: Arc<SharedHandles>,
    offloads: Vec<Job>,
    shutting_down: bool,
}

impl Experiment {
    pub fn new(
        exp_id: String,
        config: ControllerConfig,
        types: TypeRegistry,
        scheduler: Scheduler<Experiment>,
        handles: Arc<SharedHandles>,
    ) -> Self {
        Self {
            exp_id,
            config,
            types,
            globals: HashMap::new(),
            next_guid: 1,
            resources: BTreeMap::new(),
            conditions: Vec::new(),
            groups: Vec::new(),
            failures: FailureManager::new(),
            scheduler,
            handles,
            offloads: Vec::new(),
            shutting_down: false,
        }
    }

    pub fn exp_id(&self) -> &str {
        &self.exp_id
    }

    fn rm(&self, guid: Guid) -> ControllerResult<&ResourceManager> {
        self.resources
            .get(&guid)
            .ok_or(ControllerError::UnknownGuid { guid })
    }

    fn rm_mut(&mut self, guid: Guid) -> ControllerResult<&mut ResourceManager> {
        self.resources
            .get_mut(&guid)
            .ok_or(ControllerError::UnknownGuid { guid })
    }

    fn ensure_open(&self) -> ControllerResult<()> {
        if self.shutting_down {
            return Err(ControllerError::ShutDown);
        }
        Ok(())
    }

    fn reschedule_delay(&self, guid: Guid) -> Duration {
        self.resources
            .get(&guid)
            .and_then(|rm| rm.resource_type().reschedule_delay())
            .unwrap_or(self.config.reschedule_delay)
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    pub fn register_resource(&mut self, rtype: &str) -> ControllerResult<Guid> {
        self.ensure_open()?;
        let descriptor = self.types.get(rtype)?;
        let guid = Guid(self.next_guid);
        self.next_guid += 1;

        let mut rm = ResourceManager::new(guid, descriptor);
        if let Some(defaults) = self.globals.get(rtype) {
            for (name, value) in defaults {
                if let Err(e) = rm.set(name, value.clone(), WriteOrigin::Global) {
                    warn!("Resource {}: global default for '{}' not applied: {}", guid, name, e);
                }
            }
        }

        info!("Registered resource {} ({})", guid, rtype);
        self.resources.insert(guid, rm);
        Ok(guid)
    }

    pub fn set(&mut self, guid: Guid, name: &str, value: AttrValue) -> ControllerResult<()> {
        self.rm_mut(guid)?.set(name, value, WriteOrigin::Client)?;
        Ok(())
    }

    /// Class-wide default applied to resources registered afterwards
    pub fn set_global(&mut self, rtype: &str, name: &str, value: AttrValue) -> ControllerResult<()> {
        let descriptor = self.types.get(rtype)?;
        let spec = descriptor
            .attribute(name)
            .ok_or_else(|| ValidationError::UnknownAttribute {
                rtype: rtype.to_string(),
                name: name.to_string(),
            })?;

        Attribute::new(Arc::clone(spec)).check_write(Guid(0), ResourceState::New, WriteOrigin::Global)?;
        let value = spec.coerce(value)?;

        self.globals
            .entry(rtype.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, guid: Guid, name: &str) -> ControllerResult<Option<AttrValue>> {
        Ok(self.rm(guid)?.get(name)?)
    }

    pub fn enable_trace(&mut self, guid: Guid, name: &str) -> ControllerResult<()> {
        if !self.rm_mut(guid)?.enable_trace(name) {
            return Err(ControllerError::UnknownTrace {
                guid,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn register_connection(&mut self, a: Guid, b: Guid) -> ControllerResult<()> {
        self.ensure_open()?;
        let a_rm = self.rm(a)?;
        let b_rm = self.rm(b)?;

        let illegal = a == b
            || !a_rm.resource_type().allows_neighbor(b_rm.rtype())
            || !b_rm.resource_type().allows_neighbor(a_rm.rtype());
        if illegal {
            return Err(ControllerError::IllegalConnection {
                a,
                a_type: a_rm.rtype().to_string(),
                b,
                b_type: b_rm.rtype().to_string(),
            });
        }

        self.rm_mut(a)?.connect(b);
        self.rm_mut(b)?.connect(a);
        debug!("Connected resources {} <-> {}", a, b);
        Ok(())
    }

    pub fn register_condition(&mut self, condition: Condition) -> ControllerResult<()> {
        self.ensure_open()?;
        if condition.subjects.is_empty() || condition.targets.is_empty() {
            return Err(expctl_shared::DesignError::InvalidCondition {
                reason: "conditions need at least one subject and one target".to_string(),
            }
            .into());
        }
        for guid in condition.subjects.iter().chain(condition.targets.iter()) {
            self.rm(*guid)?;
        }
        if let Some(delay) = condition.delay {
            TimeSpec::After(delay).deadline(Instant::now())?;
        }
        debug!(
            "Condition: {} of {:?} waits for {:?} to reach {}",
            condition.action, condition.subjects, condition.targets, condition.state
        );
        self.conditions.push(condition);
        Ok(())
    }

    /// Stop `subject` from waiting on `targets`, for one action or all.
    ///
    /// Returns how many conditions changed.
    pub fn unregister_condition(
        &mut self,
        subject: Guid,
        targets: &BTreeSet<Guid>,
        action: Option<ResourceAction>,
    ) -> ControllerResult<usize> {
        self.rm(subject)?;
        let mut changed = 0;
        let mut split = Vec::new();

        for condition in &mut self.conditions {
            if !condition.subjects.contains(&subject)
                || action.is_some_and(|a| a != condition.action)
                || condition.targets.is_disjoint(targets)
            {
                continue;
            }
            changed += 1;

            // the other subjects keep waiting on the full target set
            let remaining: BTreeSet<Guid> = condition.targets.difference(targets).copied().collect();
            condition.subjects.remove(&subject);
            if !remaining.is_empty() {
                let mut narrowed = condition.clone();
                narrowed.subjects = BTreeSet::from([subject]);
                narrowed.targets = remaining;
                split.push(narrowed);
            }
        }

        self.conditions.retain(|c| !c.subjects.is_empty());
        self.conditions.extend(split);
        Ok(changed)
    }

    // ---------------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------------

    fn schedule_step(&self, guid: Guid, step: Step, delay: Duration) {
        let result = self.scheduler.schedule(delay, false, move |exp: &mut Experiment| {
            exp.advance(guid, step);
            Ok(Value::Null)
        });
        match result {
            Ok(_) => {}
            Err(ControllerError::ShutDown) => debug!("Resource {}: {} not scheduled, shutting down", guid, step),
            Err(e) => warn!("Resource {}: {} not scheduled: {}", guid, step, e),
        }
    }

    /// Deploy `guids` as one group; resources already deploying are skipped
    pub fn deploy_group(&mut self, guids: &[Guid]) -> ControllerResult<Vec<Guid>> {
        self.ensure_open()?;
        for guid in guids {
            self.rm(*guid)?;
        }

        let members: Vec<Guid> = guids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|guid| {
                self.resources.get(guid).is_some_and(|rm| {
                    rm.group().is_none() && rm.state() == ResourceState::New
                })
            })
            .collect();

        if members.is_empty() {
            debug!("Nothing to deploy");
            return Ok(members);
        }

        let group = self.groups.len();
        self.groups.push(members.clone());
        for guid in &members {
            if let Some(rm) = self.resources.get_mut(guid) {
                rm.set_group(group);
            }
            self.schedule_step(*guid, Step::Discover, Duration::ZERO);
        }
        info!("Deploying group {} with {} resources", group, members.len());
        Ok(members)
    }

    /// Deploy every resource that has not been deployed yet
    pub fn deploy_all(&mut self) -> ControllerResult<Vec<Guid>> {
        let guids: Vec<Guid> = self.resources.keys().copied().collect();
        self.deploy_group(&guids)
    }

    /// Issue a condition-gated action on one resource
    pub fn request(&mut self, guid: Guid, action: ResourceAction) -> ControllerResult<()> {
        self.ensure_open()?;
        let state = self.rm(guid)?.state();
        let step = Step::for_action(action).ok_or(ControllerError::InvalidTransition {
            guid,
            action,
            state,
        })?;

        let dead = state == ResourceState::Released
            || (state == ResourceState::Failed && step != Step::Release);
        if dead {
            return Err(ControllerError::InvalidTransition {
                guid,
                action,
                state,
            });
        }

        self.schedule_step(guid, step, Duration::ZERO);
        Ok(())
    }

    /// Apply an attribute value once the SET conditions of `guid` allow it
    pub fn set_deferred(&mut self, guid: Guid, name: String, value: AttrValue) -> ControllerResult<()> {
        self.ensure_open()?;
        self.rm(guid)?.get(&name)?;
        self.schedule_deferred_set(guid, name, value, Duration::ZERO)
    }

    fn schedule_deferred_set(
        &self,
        guid: Guid,
        name: String,
        value: AttrValue,
        delay: Duration,
    ) -> ControllerResult<()> {
        self.scheduler.schedule_with_origin(
            TimeSpec::After(delay),
            TaskOrigin::User,
            false,
            Box::new(move |exp: &mut Experiment| exp.deferred_set(guid, name, value)),
        )?;
        Ok(())
    }

    fn deferred_set(&mut self, guid: Guid, name: String, value: AttrValue) -> anyhow::Result<Value> {
        match self.condition_gate(guid, ResourceAction::Set) {
            Gate::Wait(delay) => {
                self.schedule_deferred_set(guid, name, value, delay)?;
            }
            Gate::Open => {
                self.set(guid, &name, value)?;
                debug!("Resource {}: deferred set of '{}' applied", guid, name);
            }
        }
        Ok(Value::Null)
    }

    // ---------------------------------------------------------------------
    // Progression
    // ---------------------------------------------------------------------

    /// One dispatch tick of `step` on `guid`: run the hook if every
    /// dependency holds, otherwise look again later
    pub fn advance(&mut self, guid: Guid, step: Step) {
        if self.shutting_down {
            return;
        }
        let Some(rm) = self.resources.get(&guid) else {
            warn!("Tick for unknown resource {}", guid);
            return;
        };

        let state = rm.state();
        let dead = state == ResourceState::Released
            || (state == ResourceState::Failed && step != Step::Release);
        if dead {
            debug!("Resource {} is {}, dropping {}", guid, state, step);
            return;
        }

        let retry = self.reschedule_delay(guid);
        if rm.is_busy() {
            self.schedule_step(guid, step, retry);
            return;
        }

        if let Some(source) = step.source() {
            if state != source {
                if state.satisfies(step.target()) {
                    debug!("Resource {} already {}, dropping {}", guid, state, step);
                } else {
                    // earlier steps are still pending
                    self.schedule_step(guid, step, retry);
                }
                return;
            }
        }

        match self.gate(guid, step) {
            Gate::Wait(delay) => {
                debug!("Resource {}: {} not ready, retrying in {:?}", guid, step, delay);
                self.schedule_step(guid, step, delay);
            }
            Gate::Open => self.dispatch_hook(guid, step),
        }
    }

    /// Connected resources whose state `guid` needs before `step`
    fn requirement_dependencies(&self, guid: Guid, step: Step) -> Vec<(Guid, ResourceState)> {
        let Some(rm) = self.resources.get(&guid) else {
            return Vec::new();
        };
        let Some(action) = step.requirement_action() else {
            return Vec::new();
        };

        let mut deps = Vec::new();
        for requirement in rm.resource_type().requirements() {
            if requirement.before != action {
                continue;
            }
            for neighbor in rm.connections() {
                if let Some(other) = self.resources.get(neighbor) {
                    if other.rtype() == requirement.neighbor_type {
                        deps.push((*neighbor, requirement.state));
                    }
                }
            }
        }
        deps
    }

    fn conditions_for(&self, guid: Guid, action: ResourceAction) -> impl Iterator<Item = &Condition> {
        self.conditions
            .iter()
            .filter(move |c| c.applies_to(guid, action))
    }

    fn state_of(&self, guid: Guid) -> Option<ResourceState> {
        self.resources.get(&guid).map(|rm| rm.state())
    }

    fn condition_gate(&self, guid: Guid, action: ResourceAction) -> Gate {
        let retry = self.reschedule_delay(guid);
        let now = Instant::now();
        let mut wait = Duration::ZERO;

        for condition in self.conditions_for(guid, action) {
            let mut last_reached: Option<Instant> = None;
            for target in &condition.targets {
                let Some(rm) = self.resources.get(target) else {
                    return Gate::Wait(retry);
                };
                if !rm.state().satisfies(condition.state) {
                    return Gate::Wait(retry);
                }
                last_reached = last_reached.max(rm.reached_at(condition.state));
            }

            if let (Some(delay), Some(last)) = (condition.delay, last_reached) {
                match last.checked_add(delay) {
                    Some(due) if due > now => wait = wait.max(due - now),
                    Some(_) => {}
                    None => return Gate::Wait(retry),
                }
            }
        }

        if wait.is_zero() {
            Gate::Open
        } else {
            Gate::Wait(wait)
        }
    }

    /// Members of the deploy group of `guid` that hold its start back
    fn group_blockers(&self, guid: Guid) -> Vec<Guid> {
        let Some(group) = self.resources.get(&guid).and_then(|rm| rm.group()) else {
            return Vec::new();
        };
        let Some(members) = self.groups.get(group) else {
            return Vec::new();
        };

        members
            .iter()
            .copied()
            .filter(|member| *member != guid)
            .filter(|member| match self.resources.get(member) {
                Some(rm) if rm.state() == ResourceState::Released => false,
                Some(rm) if rm.state() == ResourceState::Failed => rm.is_critical(),
                Some(rm) => !rm.state().satisfies(ResourceState::Ready),
                None => false,
            })
            .collect()
    }

    fn gate(&self, guid: Guid, step: Step) -> Gate {
        let retry = self.reschedule_delay(guid);

        for (dep, required) in self.requirement_dependencies(guid, step) {
            if !self.state_of(dep).is_some_and(|s| s.satisfies(required)) {
                return Gate::Wait(retry);
            }
        }

        if let Some(action) = step.condition_action() {
            if let Gate::Wait(delay) = self.condition_gate(guid, action) {
                return Gate::Wait(delay);
            }
        }

        if step == Step::Start && self.config.wait_all_ready && !self.group_blockers(guid).is_empty() {
            return Gate::Wait(retry);
        }

        Gate::Open
    }

    fn hook_context(&self, guid: Guid) -> ControllerResult<HookContext> {
        let rm = self.rm(guid)?;
        let neighbors = rm
            .connections()
            .iter()
            .filter_map(|n| self.resources.get(n))
            .map(|n| Neighbor {
                guid: n.guid(),
                rtype: n.rtype().to_string(),
                state: n.state(),
            })
            .collect();

        Ok(
            HookContext::new(guid, rm.rtype(), &self.exp_id, Arc::clone(&self.handles))
                .with_attributes(rm.attribute_values())
                .with_neighbors(neighbors)
                .with_traces(rm.enabled_traces().clone()),
        )
    }

    fn dispatch_hook(&mut self, guid: Guid, step: Step) {
        let ctx = match self.hook_context(guid) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Resource {}: cannot build hook context: {}", guid, e);
                return;
            }
        };
        let Some(rm) = self.resources.get_mut(&guid) else {
            return;
        };
        rm.begin(step);
        let driver = rm.driver();
        let scheduler = self.scheduler.clone();

        self.offloads.push(Box::new(move || {
            let mut ctx = ctx;
            let outcome = run_hook(&driver, step, &mut ctx);
            scheduler
                .schedule(TimeSpec::now(), false, move |exp: &mut Experiment| {
                    exp.complete_step(guid, step, outcome, ctx);
                    Ok(Value::Null)
                })
                .map(|_| ())
                .map_err(|e| anyhow::anyhow!("resource {}: {} outcome not delivered: {}", guid, step, e))
        }));
    }

    /// Apply the outcome of a driver hook
    pub fn complete_step(
        &mut self,
        guid: Guid,
        step: Step,
        outcome: anyhow::Result<()>,
        mut ctx: HookContext,
    ) {
        let Some(rm) = self.resources.get_mut(&guid) else {
            return;
        };
        rm.end();
        if rm.state() == ResourceState::Released {
            debug!("Resource {} released while {} was running", guid, step);
            return;
        }

        for (name, value) in ctx.take_updates() {
            if let Err(e) = rm.set(&name, value, WriteOrigin::Driver) {
                warn!("Resource {}: driver update of '{}' rejected: {}", guid, name, e);
            }
        }

        match outcome {
            Ok(()) => {
                rm.set_state(step.target());
                let auto_start = rm.group().is_some();

                match step {
                    Step::Discover => self.schedule_step(guid, Step::Provision, Duration::ZERO),
                    Step::Provision => self.schedule_step(guid, Step::Deploy, Duration::ZERO),
                    Step::Deploy if auto_start => {
                        self.schedule_step(guid, Step::Start, Duration::ZERO)
                    }
                    _ => {}
                }

                for (action, delay) in ctx.take_requests() {
                    match Step::for_action(action) {
                        Some(follow_up) => self.schedule_step(guid, follow_up, delay),
                        None => warn!("Resource {}: driver requested unsupported {}", guid, action),
                    }
                }
            }
            Err(e) => {
                let message = format!("{} failed: {:#}", step, e);
                error!("Resource {} ({}): {}", guid, rm.rtype(), message);
                let critical = rm.is_critical();
                rm.fail(message.clone());
                if step == Step::Release {
                    // a failed release still leaves nothing to manage
                    rm.set_state(ResourceState::Released);
                }
                self.failures.resource_failed(guid, critical, message);
            }
        }
    }

    pub fn take_offloads(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.offloads)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn state(&self, guid: Guid) -> ControllerResult<ResourceState> {
        Ok(self.rm(guid)?.state())
    }

    pub fn resource_info(&self, guid: Guid) -> ControllerResult<ResourceInfo> {
        Ok(self.rm(guid)?.info())
    }

    pub fn resources(&self) -> Vec<Guid> {
        self.resources.keys().copied().collect()
    }

    pub fn get_connected(&self, guid: Guid, rtype: Option<&str>) -> ControllerResult<Vec<Guid>> {
        Ok(self
            .rm(guid)?
            .connections()
            .iter()
            .copied()
            .filter(|n| {
                rtype.is_none_or(|wanted| {
                    self.resources.get(n).is_some_and(|rm| rm.rtype() == wanted)
                })
            })
            .collect())
    }

    /// Classify `guids` against `goal` for one wait poll
    pub fn probe(&self, guids: &[Guid], goal: ResourceState) -> ControllerResult<WaitProbe> {
        let mut probe = WaitProbe::default();
        for guid in guids {
            let state = self.rm(*guid)?.state();
            if reaches(state, goal) {
                probe.reached.push(*guid);
            } else if self.doomed(*guid, goal, &mut HashSet::new()) {
                probe.failed.push(*guid);
            } else {
                probe.pending.push(*guid);
            }
        }
        probe.aborted = self.failures.abort_reason();
        Ok(probe)
    }

    /// Whether `guid` can never reach `goal` because something it still
    /// needs failed or was released
    fn doomed(&self, guid: Guid, goal: ResourceState, visiting: &mut HashSet<Guid>) -> bool {
        let Some(rm) = self.resources.get(&guid) else {
            return true;
        };
        let state = rm.state();
        if reaches(state, goal) {
            return false;
        }
        if state.is_terminal() {
            return true;
        }
        if !visiting.insert(guid) {
            return false;
        }

        for step in Step::path(state, goal) {
            let mut needed = self.requirement_dependencies(guid, step);
            if let Some(action) = step.condition_action() {
                for condition in self.conditions_for(guid, action) {
                    needed.extend(condition.targets.iter().map(|t| (*t, condition.state)));
                }
            }

            for (dep, required) in needed {
                let satisfied = self.state_of(dep).is_some_and(|s| s.satisfies(required));
                if !satisfied && self.doomed(dep, required, visiting) {
                    return true;
                }
            }

            if step == Step::Start && self.config.wait_all_ready {
                for member in self.group_blockers(guid) {
                    if self.doomed(member, ResourceState::Ready, visiting) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Every resource `guid` depends on, through requirements or conditions
    fn all_dependencies(&self, guid: Guid) -> BTreeSet<Guid> {
        let mut deps = BTreeSet::new();
        for step in [
            Step::Discover,
            Step::Provision,
            Step::Deploy,
            Step::Start,
            Step::Stop,
        ] {
            deps.extend(self.requirement_dependencies(guid, step).into_iter().map(|(d, _)| d));
        }
        for condition in self.conditions.iter().filter(|c| c.subjects.contains(&guid)) {
            deps.extend(condition.targets.iter().copied());
        }
        deps.remove(&guid);
        deps
    }

    /// Unreleased resources in release layers: dependents before the
    /// resources they depend on. Cycles are released together.
    pub fn release_order(&self) -> Vec<Vec<Guid>> {
        let mut remaining: BTreeSet<Guid> = self
            .resources
            .iter()
            .filter(|(_, rm)| rm.state() != ResourceState::Released)
            .map(|(guid, _)| *guid)
            .collect();
        let deps: BTreeMap<Guid, BTreeSet<Guid>> = remaining
            .iter()
            .map(|guid| (*guid, self.all_dependencies(*guid)))
            .collect();

        let mut layers = Vec::new();
        while !remaining.is_empty() {
            let mut layer: Vec<Guid> = remaining
                .iter()
                .copied()
                .filter(|candidate| {
                    !remaining.iter().any(|other| {
                        other != candidate
                            && deps.get(other).is_some_and(|d| d.contains(candidate))
                    })
                })
                .collect();
            if layer.is_empty() {
                debug!("Dependency cycle among {:?}, releasing together", remaining);
                layer = remaining.iter().copied().collect();
            }
            for guid in &layer {
                remaining.remove(guid);
            }
            layers.push(layer);
        }
        layers
    }

    /// Driver and context needed to read a trace off the dispatch task
    pub fn trace_target(&self, guid: Guid, name: &str) -> ControllerResult<(SharedDriver, HookContext)> {
        let rm = self.rm(guid)?;
        if !rm.resource_type().has_trace(name) {
            return Err(ControllerError::UnknownTrace {
                guid,
                name: name.to_string(),
            });
        }
        Ok((rm.driver(), self.hook_context(guid)?))
    }

    /// Export the current experiment as a replayable design
    pub fn design(&self) -> ExperimentDesign {
        let mut design = ExperimentDesign::new().with_exp_id(self.exp_id.clone());
        for (guid, rm) in &self.resources {
            design.resources.push(ResourceDesign {
                rtype: rm.rtype().to_string(),
                attributes: rm.modified_attributes(),
                traces: rm.enabled_traces().iter().cloned().collect(),
            });
            for other in rm.connections().iter().filter(|other| *other > guid) {
                design.connections.push((*guid, *other));
            }
        }
        design.conditions = self.conditions.clone();
        design
    }

    /// Register everything a design describes. Guids must come out in
    /// design order, so this only works on a fresh experiment.
    pub fn apply_design(&mut self, design: &ExperimentDesign) -> ControllerResult<Vec<Guid>> {
        design.validate()?;
        if !self.resources.is_empty() {
            return Err(ControllerError::Config {
                message: "a design can only be applied to an empty experiment".to_string(),
            });
        }

        let mut guids = Vec::with_capacity(design.resources.len());
        for (index, resource) in design.resources.iter().enumerate() {
            let guid = self.register_resource(&resource.rtype)?;
            debug_assert_eq!(guid, ExperimentDesign::guid_at(index));
            for (name, value) in &resource.attributes {
                self.set(guid, name, value.clone())?;
            }
            for trace in &resource.traces {
                self.enable_trace(guid, trace)?;
            }
            guids.push(guid);
        }
        for (a, b) in &design.connections {
            self.register_connection(*a, *b)?;
        }
        for condition in &design.conditions {
            self.register_condition(condition.clone())?;
        }
        Ok(guids)
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        let dropped = self.offloads.len();
        self.offloads.clear();
        if dropped > 0 {
            debug!("Dropped {} unsubmitted jobs at shutdown", dropped);
        }
    }

    /// Prepare the release hook of `guid`, or `None` if already released
    pub fn release_job(&mut self, guid: Guid) -> Option<(SharedDriver, HookContext)> {
        let ctx = self.hook_context(guid).ok()?;
        let rm = self.resources.get_mut(&guid)?;
        if rm.state() == ResourceState::Released {
            return None;
        }
        rm.begin(Step::Release);
        Some((rm.driver(), ctx))
    }

    pub fn finish_release(&mut self, guid: Guid, outcome: anyhow::Result<()>) {
        let Some(rm) = self.resources.get_mut(&guid) else {
            return;
        };
        rm.end();
        if let Err(e) = outcome {
            let message = format!("release failed: {:#}", e);
            let critical = rm.is_critical();
            rm.fail(message.clone());
            self.failures.resource_failed(guid, critical, message);
        }
        if let Some(rm) = self.resources.get_mut(&guid) {
            rm.set_state(ResourceState::Released);
        }
    }

    pub fn final_states(&self) -> BTreeMap<Guid, ResourceState> {
        self.resources
            .iter()
            .map(|(guid, rm)| (*guid, rm.state()))
            .collect()
    }
}
