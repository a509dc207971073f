//! The dispatch loop: the only code that touches experiment state.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::experiment::{Experiment, run_hook};
use crate::failure::FailureLevel;
use crate::handles::SharedHandles;
use crate::resource::Step;
use crate::scheduler::{Scheduler, TaskOrigin, TaskStatus};
use crate::worker_pool::WorkerPool;
use expctl_shared::{Guid, ResourceState};

/// Messages that bypass the task queue
pub(crate) enum Control {
    Shutdown(oneshot::Sender<ShutdownReport>),
}

/// What `shutdown` did
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub exp_id: String,
    /// Resources whose release hook ran during shutdown
    pub released: Vec<Guid>,
    /// Scheduled tasks withdrawn without running
    pub withdrawn_tasks: usize,
    pub failure_level: FailureLevel,
    pub failures: Vec<String>,
    pub states: BTreeMap<Guid, ResourceState>,
}

impl ShutdownReport {
    pub fn all_released(&self) -> bool {
        self.states.values().all(|s| *s == ResourceState::Released)
    }
}

pub(crate) async fn dispatch_loop(
    mut exp: Experiment,
    scheduler: Scheduler<Experiment>,
    pool: Arc<WorkerPool>,
    handles: Arc<SharedHandles>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    info!("Dispatch loop started for experiment {}", exp.exp_id());

    let reply = loop {
        tokio::select! {
            biased;

            message = control.recv() => match message {
                Some(Control::Shutdown(reply)) => break Some(reply),
                None => {
                    debug!("Controller handle dropped, shutting down");
                    break None;
                }
            },

            task = scheduler.next_task() => {
                let Some(task) = task else {
                    warn!("Scheduler closed under the dispatch loop");
                    break None;
                };

                let outcome = scheduler.run(task, &mut exp);
                if outcome.status == TaskStatus::Error {
                    let message = outcome
                        .error
                        .as_ref()
                        .map(|e| format!("{:#}", e))
                        .unwrap_or_default();
                    match outcome.origin {
                        TaskOrigin::User => exp.failures.task_failed(outcome.id, message),
                        TaskOrigin::Internal => exp.failures.experiment_failed(message),
                    }
                }

                submit_offloads(&mut exp, &pool).await;
                if let Err(e) = pool.sync() {
                    warn!("Background job failed: {}", e);
                }
            }
        }
    };

    let report = shutdown_sequence(&mut exp, &scheduler, &pool, &handles).await;
    if let Some(reply) = reply {
        if reply.send(report).is_err() {
            debug!("Shutdown requester went away before the report was ready");
        }
    }
}

async fn submit_offloads(exp: &mut Experiment, pool: &WorkerPool) {
    for job in exp.take_offloads() {
        // the job reports back through the scheduler, the handle is not needed
        if let Err(e) = pool.put(job).await {
            error!("Could not hand a driver hook to the worker pool: {}", e);
            exp.failures.experiment_failed(format!("worker pool rejected a job: {}", e));
        }
    }
}

async fn shutdown_sequence(
    exp: &mut Experiment,
    scheduler: &Scheduler<Experiment>,
    pool: &WorkerPool,
    handles: &SharedHandles,
) -> ShutdownReport {
    info!("Shutting down experiment {}", exp.exp_id());
    exp.begin_shutdown();
    let mut withdrawn = scheduler.cancel_all();
    pool.empty();

    let mut released = Vec::new();
    for layer in exp.release_order() {
        let mut running = Vec::new();
        for guid in layer {
            let Some((driver, ctx)) = exp.release_job(guid) else {
                continue;
            };
            let submitted = pool
                .put(move || {
                    let mut ctx = ctx;
                    run_hook(&driver, Step::Release, &mut ctx)
                })
                .await;
            match submitted {
                Ok(handle) => running.push((guid, handle)),
                Err(e) => {
                    exp.finish_release(guid, Err(e.into()));
                    released.push(guid);
                }
            }
        }

        // one layer at a time so dependents are gone before what they use
        for (guid, handle) in running {
            let outcome = handle.join().await.map_err(anyhow::Error::from);
            exp.finish_release(guid, outcome);
            released.push(guid);
        }
    }

    scheduler.close();
    withdrawn += scheduler.cancel_all();
    pool.destroy().await;
    handles.teardown_all();

    let report = ShutdownReport {
        exp_id: exp.exp_id().to_string(),
        released,
        withdrawn_tasks: withdrawn,
        failure_level: exp.failures.level(),
        failures: exp
            .failures
            .records()
            .iter()
            .map(|r| r.message.clone())
            .collect(),
        states: exp.final_states(),
    };
    info!(
        "Experiment {} shut down: {} resources released, {} tasks withdrawn, {}",
        report.exp_id,
        report.released.len(),
        report.withdrawn_tasks,
        report.failure_level
    );
    report
}
