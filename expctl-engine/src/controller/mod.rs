//! Experiment controller.
//!
//! [`ExperimentController`] is the client-facing handle of one experiment run.
//! The experiment itself (resources, connections, conditions, failure state)
//! lives on a dedicated dispatch task; every method here is delivered to that
//! task as a zero-delay scheduler task and answered through a oneshot channel,
//! so all state changes are serialized without locks on the experiment graph.
//!
//! # Example
//!
//! ```no_run
//! use expctl_engine::controller::ExperimentController;
//! use expctl_engine::config::ControllerConfig;
//! use expctl_engine::drivers::dummy_registry;
//! use expctl_shared::{ResourceAction, ResourceState};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let ec = ExperimentController::new(ControllerConfig::default(), dummy_registry())?;
//! let node = ec.register_resource("dummy::Node").await?;
//! let app = ec.register_resource("dummy::Application").await?;
//! ec.set(node, "hostname", "node1").await?;
//! ec.register_connection(app, node).await?;
//! ec.deploy().await?;
//! ec.wait_started(&[app]).await?;
//! ec.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod experiment;

pub use dispatch::ShutdownReport;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::failure::FailureLevel;
use crate::handles::SharedHandles;
use crate::resource::{ResourceInfo, TypeRegistry};
use crate::scheduler::{Scheduler, TaskId, TaskOrigin, TaskSnapshot};
use crate::utils::lock_unpoisoned;
use crate::worker_pool::WorkerPool;
use dispatch::{Control, dispatch_loop};
use experiment::Experiment;
use expctl_shared::errors::{ControllerError, ControllerResult};
use expctl_shared::{
    AttrValue, Condition, ExperimentDesign, Guid, ResourceAction, ResourceState, TimeSpec,
};

/// Outcome of a wait
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaitReport {
    /// Resources that reached the awaited state
    pub reached: Vec<Guid>,
    /// Resources that failed or can no longer get there
    pub failed: Vec<Guid>,
}

impl WaitReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ExperimentController {
    exp_id: String,
    config: ControllerConfig,
    scheduler: Scheduler<Experiment>,
    handles: Arc<SharedHandles>,
    pool: Arc<WorkerPool>,
    control: mpsc::UnboundedSender<Control>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    report: Mutex<Option<ShutdownReport>>,
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("exp_id", &self.exp_id)
            .field("pending_tasks", &self.scheduler.pending())
            .finish()
    }
}

fn generate_exp_id() -> String {
    format!("exp-{:016x}", fastrand::u64(..))
}

impl ExperimentController {
    /// Create a controller and start its dispatch loop and worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ControllerConfig, types: TypeRegistry) -> ControllerResult<Self> {
        config.validate()?;
        let exp_id = config.exp_id.clone().unwrap_or_else(generate_exp_id);

        let scheduler = Scheduler::new();
        let handles = Arc::new(SharedHandles::new());
        let pool = Arc::new(WorkerPool::new(config.max_workers, config.queue_capacity));
        pool.start();

        let experiment = Experiment::new(
            exp_id.clone(),
            config.clone(),
            types,
            scheduler.clone(),
            Arc::clone(&handles),
        );
        let (control, control_rx) = mpsc::unbounded_channel();
        let dispatch = tokio::spawn(dispatch_loop(
            experiment,
            scheduler.clone(),
            Arc::clone(&pool),
            Arc::clone(&handles),
            control_rx,
        ));

        info!(
            "Experiment controller {} started ({} workers)",
            exp_id, config.max_workers
        );
        Ok(Self {
            exp_id,
            config,
            scheduler,
            handles,
            pool,
            control,
            dispatch: Mutex::new(Some(dispatch)),
            report: Mutex::new(None),
        })
    }

    /// Create a controller and register everything `design` describes.
    ///
    /// The design's experiment id is used unless the configuration names one.
    pub async fn from_design(
        mut config: ControllerConfig,
        types: TypeRegistry,
        design: &ExperimentDesign,
    ) -> ControllerResult<Self> {
        if config.exp_id.is_none() {
            config.exp_id = design.exp_id.clone();
        }
        let controller = Self::new(config, types)?;
        let design = design.clone();
        let guids = controller.call(move |exp| exp.apply_design(&design)).await?;
        debug!("Design replayed with {} resources", guids.len());
        Ok(controller)
    }

    pub fn exp_id(&self) -> &str {
        &self.exp_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Backend handle registry shared with the drivers
    pub fn handles(&self) -> &Arc<SharedHandles> {
        &self.handles
    }

    /// Run `op` on the dispatch task and wait for its answer
    async fn call<T, F>(&self, op: F) -> ControllerResult<T>
    where
        F: FnOnce(&mut Experiment) -> ControllerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.scheduler
            .schedule(TimeSpec::now(), false, move |exp: &mut Experiment| {
                // the caller may have given up waiting
                let _ = tx.send(op(exp));
                Ok(Value::Null)
            })?;
        rx.await.map_err(|_| ControllerError::ShutDown)?
    }

    // ---------------------------------------------------------------------
    // Experiment description
    // ---------------------------------------------------------------------

    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn register_resource(&self, rtype: &str) -> ControllerResult<Guid> {
        let rtype = rtype.to_string();
        self.call(move |exp| exp.register_resource(&rtype)).await
    }

    /// Set an attribute value; fails if its flags forbid the write in the
    /// resource's current state
    #[instrument(skip(self, value), fields(exp_id = %self.exp_id))]
    pub async fn set(&self, guid: Guid, name: &str, value: impl Into<AttrValue>) -> ControllerResult<()> {
        let name = name.to_string();
        let value = value.into();
        self.call(move |exp| exp.set(guid, &name, value)).await
    }

    /// Default for `name` on every resource of `rtype` registered from now on
    #[instrument(skip(self, value), fields(exp_id = %self.exp_id))]
    pub async fn set_global(
        &self,
        rtype: &str,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> ControllerResult<()> {
        let rtype = rtype.to_string();
        let name = name.to_string();
        let value = value.into();
        self.call(move |exp| exp.set_global(&rtype, &name, value)).await
    }

    pub async fn get(&self, guid: Guid, name: &str) -> ControllerResult<Option<AttrValue>> {
        let name = name.to_string();
        self.call(move |exp| exp.get(guid, &name)).await
    }

    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn register_connection(&self, a: Guid, b: Guid) -> ControllerResult<()> {
        self.call(move |exp| exp.register_connection(a, b)).await
    }

    /// Gate `action` on every subject until all targets reach `state`,
    /// plus `delay` after the last of them got there
    #[instrument(skip(self, subjects, targets), fields(exp_id = %self.exp_id))]
    pub async fn register_condition(
        &self,
        subjects: impl IntoIterator<Item = Guid>,
        action: ResourceAction,
        targets: impl IntoIterator<Item = Guid>,
        state: ResourceState,
        delay: Option<Duration>,
    ) -> ControllerResult<()> {
        let mut condition = Condition::new(subjects, action, targets, state);
        condition.delay = delay;
        self.call(move |exp| exp.register_condition(condition)).await
    }

    /// Stop `subject` waiting on `targets`, for `action` or for every action.
    /// Returns the number of conditions affected.
    pub async fn unregister_condition(
        &self,
        subject: Guid,
        targets: impl IntoIterator<Item = Guid>,
        action: Option<ResourceAction>,
    ) -> ControllerResult<usize> {
        let targets: BTreeSet<Guid> = targets.into_iter().collect();
        self.call(move |exp| exp.unregister_condition(subject, &targets, action))
            .await
    }

    pub async fn enable_trace(&self, guid: Guid, name: &str) -> ControllerResult<()> {
        let name = name.to_string();
        self.call(move |exp| exp.enable_trace(guid, &name)).await
    }

    // ---------------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------------

    /// Deploy every resource not deployed yet as one group; each is started
    /// once it is READY
    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn deploy(&self) -> ControllerResult<Vec<Guid>> {
        self.call(|exp| exp.deploy_all()).await
    }

    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn deploy_group(&self, guids: &[Guid]) -> ControllerResult<Vec<Guid>> {
        let guids = guids.to_vec();
        self.call(move |exp| exp.deploy_group(&guids)).await
    }

    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn start(&self, guid: Guid) -> ControllerResult<()> {
        self.call(move |exp| exp.request(guid, ResourceAction::Start)).await
    }

    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn stop(&self, guid: Guid) -> ControllerResult<()> {
        self.call(move |exp| exp.request(guid, ResourceAction::Stop)).await
    }

    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn release(&self, guid: Guid) -> ControllerResult<()> {
        self.call(move |exp| exp.request(guid, ResourceAction::Release)).await
    }

    /// Set an attribute once the SET conditions of `guid` hold.
    ///
    /// Returns as soon as the write is queued; a rejected write shows up as
    /// a task failure.
    pub async fn set_deferred(
        &self,
        guid: Guid,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> ControllerResult<()> {
        let name = name.to_string();
        let value = value.into();
        self.call(move |exp| exp.set_deferred(guid, name, value)).await
    }

    // ---------------------------------------------------------------------
    // Waiting
    // ---------------------------------------------------------------------

    /// Poll until every guid reached `state` or can no longer reach it
    pub async fn wait(&self, guids: &[Guid], state: ResourceState) -> ControllerResult<WaitReport> {
        let deadline = self
            .config
            .wait_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        let guids = guids.to_vec();

        loop {
            let polled = guids.clone();
            let probe = self.call(move |exp| exp.probe(&polled, state)).await?;

            if let Some(reason) = probe.aborted {
                return Err(ControllerError::Aborted { reason });
            }
            if probe.pending.is_empty() {
                if !probe.failed.is_empty() {
                    warn!("Resources {:?} will never reach {}", probe.failed, state);
                }
                return Ok(probe.into_report());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ControllerError::WaitTimeout {
                    guids: probe.pending,
                    state,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub async fn wait_deployed(&self, guids: &[Guid]) -> ControllerResult<WaitReport> {
        self.wait(guids, ResourceState::Ready).await
    }

    pub async fn wait_started(&self, guids: &[Guid]) -> ControllerResult<WaitReport> {
        self.wait(guids, ResourceState::Started).await
    }

    pub async fn wait_finished(&self, guids: &[Guid]) -> ControllerResult<WaitReport> {
        self.wait(guids, ResourceState::Stopped).await
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub async fn state(&self, guid: Guid) -> ControllerResult<ResourceState> {
        self.call(move |exp| exp.state(guid)).await
    }

    pub async fn resource_info(&self, guid: Guid) -> ControllerResult<ResourceInfo> {
        self.call(move |exp| exp.resource_info(guid)).await
    }

    pub async fn resources(&self) -> ControllerResult<Vec<Guid>> {
        self.call(|exp| Ok(exp.resources())).await
    }

    /// Neighbors of `guid`, optionally only those of type `rtype`
    pub async fn get_connected(&self, guid: Guid, rtype: Option<&str>) -> ControllerResult<Vec<Guid>> {
        let rtype = rtype.map(str::to_string);
        self.call(move |exp| exp.get_connected(guid, rtype.as_deref()))
            .await
    }

    pub async fn failure_level(&self) -> ControllerResult<FailureLevel> {
        self.call(|exp| Ok(exp.failures.level())).await
    }

    /// Current experiment as a replayable design
    pub async fn design(&self) -> ControllerResult<ExperimentDesign> {
        self.call(|exp| Ok(exp.design())).await
    }

    /// Read trace `name` from the driver of `guid`.
    ///
    /// The driver is queried on a worker, never on the dispatch task.
    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn trace(&self, guid: Guid, name: &str) -> ControllerResult<String> {
        let trace_name = name.to_string();
        let (driver, ctx) = self
            .call(move |exp| exp.trace_target(guid, &trace_name))
            .await?;

        let trace_name = name.to_string();
        let handle = self
            .pool
            .put(move || {
                let mut driver = lock_unpoisoned(&driver);
                driver.trace(&trace_name, &ctx)
            })
            .await?;
        handle.join().await.map_err(|e| ControllerError::Driver {
            guid,
            message: e.to_string(),
        })
    }

    // ---------------------------------------------------------------------
    // Ad hoc tasks
    // ---------------------------------------------------------------------

    /// Run `callback` on the dispatch task at `when`.
    ///
    /// The callback must not block. With `track` set, its result or error
    /// stays available through [`get_task`](Self::get_task); a failing
    /// callback raises the failure level to TASK_FAILURE either way.
    pub fn schedule<F>(&self, when: impl Into<TimeSpec>, track: bool, callback: F) -> ControllerResult<TaskId>
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        self.scheduler.schedule_with_origin(
            when.into(),
            TaskOrigin::User,
            track,
            Box::new(move |_: &mut Experiment| callback()),
        )
    }

    /// Withdraw a task that has not run yet
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn get_task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.scheduler.get_task(id)
    }

    /// Tasks still waiting in the scheduler
    pub fn pending_tasks(&self) -> usize {
        self.scheduler.pending()
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Withdraw pending work and release every resource, dependents first.
    ///
    /// Release failures are recorded, never fatal. Calling this again
    /// returns the first report.
    #[instrument(skip(self), fields(exp_id = %self.exp_id))]
    pub async fn shutdown(&self) -> ControllerResult<ShutdownReport> {
        if let Some(report) = lock_unpoisoned(&self.report).clone() {
            return Ok(report);
        }

        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Shutdown(tx))
            .map_err(|_| ControllerError::ShutDown)?;
        let report = rx.await.map_err(|_| ControllerError::ShutDown)?;

        let dispatch = lock_unpoisoned(&self.dispatch).take();
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                warn!("Dispatch loop ended abnormally: {}", e);
            }
        }

        *lock_unpoisoned(&self.report) = Some(report.clone());
        Ok(report)
    }
}

impl Drop for ExperimentController {
    fn drop(&mut self) {
        if let Some(handle) = lock_unpoisoned(&self.dispatch).take() {
            warn!(
                "Experiment {} dropped without shutdown, resources were not released",
                self.exp_id
            );
            handle.abort();
        }
    }
}
