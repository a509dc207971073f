//! Time-ordered task scheduler.
//!
//! Tasks live in a binary min-heap keyed by (absolute due time, insertion
//! sequence), so tasks with equal deadlines run in the order they were
//! scheduled. The scheduler itself never runs anything on its own: exactly one
//! dispatch task pulls due tasks with [`Scheduler::next_task`] and executes
//! them with [`Scheduler::run`] against the context it owns. Any thread may
//! schedule, withdraw or inspect tasks.
//!
//! Callbacks must not block; blocking work belongs on the worker pool.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::utils::{lock_unpoisoned, panic_message};
use expctl_shared::TimeSpec;
use expctl_shared::errors::{ControllerError, ControllerResult};

/// Task identifier, doubling as the insertion sequence number
pub type TaskId = u64;

/// Task callback run on the dispatch task with exclusive access to `C`
pub type TaskCallback<C> = Box<dyn FnOnce(&mut C) -> anyhow::Result<Value> + Send + 'static>;

/// Execution status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    New,
    Done,
    Error,
}

/// Who scheduled a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    /// Engine bookkeeping (resource progression, client commands)
    Internal,
    /// Ad hoc callback scheduled by the experiment client
    User,
}

/// A scheduled unit of work
pub struct Task<C> {
    pub id: TaskId,
    pub due: Instant,
    pub origin: TaskOrigin,
    track: bool,
    callback: TaskCallback<C>,
}

impl<C> std::fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("due", &self.due)
            .field("origin", &self.origin)
            .field("track", &self.track)
            .finish()
    }
}

impl<C> Task<C> {
    /// Invoke the callback directly, bypassing status tracking
    pub fn invoke(self, ctx: &mut C) -> anyhow::Result<Value> {
        (self.callback)(ctx)
    }
}

// Reversed so that `BinaryHeap` (a max-heap) pops the earliest task first.
impl<C> Ord for Task<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl<C> PartialOrd for Task<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> PartialEq for Task<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<C> Eq for Task<C> {}

/// Point-in-time view of a task
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    pub due: Instant,
    pub tracked: bool,
    pub result: Option<Value>,
    pub error: Option<Arc<anyhow::Error>>,
}

/// Outcome of running one task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub origin: TaskOrigin,
    pub status: TaskStatus,
    pub error: Option<Arc<anyhow::Error>>,
}

#[derive(Debug)]
struct TaskRecord {
    status: TaskStatus,
    due: Instant,
    tracked: bool,
    result: Option<Value>,
    error: Option<Arc<anyhow::Error>>,
}

struct Inner<C> {
    queue: Mutex<BinaryHeap<Task<C>>>,
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    next_id: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

/// Cloneable handle to a shared task queue
pub struct Scheduler<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(BinaryHeap::new()),
                records: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Schedule an internal task
    pub fn schedule<F>(&self, when: impl Into<TimeSpec>, track: bool, callback: F) -> ControllerResult<TaskId>
    where
        F: FnOnce(&mut C) -> anyhow::Result<Value> + Send + 'static,
    {
        self.schedule_with_origin(when.into(), TaskOrigin::Internal, track, Box::new(callback))
    }

    /// Schedule a task with an explicit origin.
    ///
    /// Relative specifications are resolved against the current instant.
    pub fn schedule_with_origin(
        &self,
        when: TimeSpec,
        origin: TaskOrigin,
        track: bool,
        callback: TaskCallback<C>,
    ) -> ControllerResult<TaskId> {
        if self.is_closed() {
            return Err(ControllerError::ShutDown);
        }

        let due = when.deadline(Instant::now())?;
        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::SeqCst);

        lock_unpoisoned(&self.inner.records).insert(
            id,
            TaskRecord {
                status: TaskStatus::New,
                due,
                tracked: track,
                result: None,
                error: None,
            },
        );
        lock_unpoisoned(&self.inner.queue).push(Task {
            id,
            due,
            origin,
            track,
            callback,
        });

        trace!("Scheduled task {} ({:?})", id, origin);
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Withdraw a task before it runs.
    ///
    /// Returns `false` when the task already ran or never existed.
    pub fn cancel(&self, id: TaskId) -> bool {
        let removed = {
            let mut queue = lock_unpoisoned(&self.inner.queue);
            let before = queue.len();
            queue.retain(|task| task.id != id);
            queue.len() != before
        };
        if removed {
            lock_unpoisoned(&self.inner.records).remove(&id);
            debug!("Withdrew task {}", id);
        }
        removed
    }

    /// Withdraw every pending task, returning how many were dropped
    pub fn cancel_all(&self) -> usize {
        let withdrawn: Vec<TaskId> = {
            let mut queue = lock_unpoisoned(&self.inner.queue);
            queue.drain().map(|task| task.id).collect()
        };
        let mut records = lock_unpoisoned(&self.inner.records);
        for id in &withdrawn {
            records.remove(id);
        }
        withdrawn.len()
    }

    /// Stop accepting tasks and wake the dispatcher
    pub fn close(&self) {
        self.inner.closed.store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::SeqCst)
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        lock_unpoisoned(&self.inner.queue).len()
    }

    /// Deadline of the earliest pending task
    pub fn next_deadline(&self) -> Option<Instant> {
        lock_unpoisoned(&self.inner.queue).peek().map(|task| task.due)
    }

    /// Pop the earliest task regardless of its deadline
    pub fn next(&self) -> Option<Task<C>> {
        lock_unpoisoned(&self.inner.queue).pop()
    }

    /// Pop the earliest task if it is due at `now`
    pub fn pop_due(&self, now: Instant) -> Option<Task<C>> {
        let mut queue = lock_unpoisoned(&self.inner.queue);
        match queue.peek() {
            Some(task) if task.due <= now => queue.pop(),
            _ => None,
        }
    }

    /// Wait until the earliest task is due and pop it.
    ///
    /// Returns `None` once the scheduler is closed. Cancel-safe: a task is
    /// only removed from the heap in the same synchronous step that returns it.
    pub async fn next_task(&self) -> Option<Task<C>> {
        loop {
            if self.is_closed() {
                return None;
            }

            let now = Instant::now();
            match self.next_deadline() {
                None => self.inner.notify.notified().await,
                Some(due) if due <= now => {
                    if let Some(task) = self.pop_due(now) {
                        return Some(task);
                    }
                }
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => {}
                        _ = self.inner.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Run a task against `ctx` and record its outcome.
    ///
    /// Panics inside the callback are captured as errors. Records of untracked
    /// tasks are discarded once the task completes.
    pub fn run(&self, task: Task<C>, ctx: &mut C) -> TaskOutcome {
        let id = task.id;
        let origin = task.origin;
        let track = task.track;

        let outcome = match catch_unwind(AssertUnwindSafe(|| (task.callback)(ctx))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "task {} panicked: {}",
                id,
                panic_message(payload)
            )),
        };

        let (status, result, error) = match outcome {
            Ok(value) => (TaskStatus::Done, Some(value), None),
            Err(e) => (TaskStatus::Error, None, Some(Arc::new(e))),
        };

        let mut records = lock_unpoisoned(&self.inner.records);
        if track {
            if let Some(record) = records.get_mut(&id) {
                record.status = status;
                record.result = result;
                record.error = error.clone();
            }
        } else {
            records.remove(&id);
        }

        TaskOutcome {
            id,
            origin,
            status,
            error,
        }
    }

    /// Current status of a task, with result or error when tracked
    pub fn get_task(&self, id: TaskId) -> Option<TaskSnapshot> {
        lock_unpoisoned(&self.inner.records).get(&id).map(|record| TaskSnapshot {
            id,
            status: record.status,
            due: record.due,
            tracked: record.tracked,
            result: record.result.clone(),
            error: record.error.clone(),
        })
    }
}
