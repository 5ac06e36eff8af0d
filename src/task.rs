//! Per-task state: the record, its transition rules, and the registry the
//! control API reads from.
//!
//! A [`TaskRecord`] is owned by its worker; everyone else sees snapshots
//! through the [`TaskHandle`]. Transitions follow a fixed table: terminal
//! states are absorbing, and the only cycle is `Running ↔ Retrying`.

use crate::classify::ErrorKind;
use crate::types::{epoch_secs, QueueName, TaskSubmission};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Accepted, waiting for a worker.
    Pending,
    /// A worker is streaming an attempt.
    Running,
    /// Waiting out the backoff delay before the next attempt.
    Retrying,
    /// Terminal: streamed to completion.
    Succeeded,
    /// Terminal: failed with no output.
    Failed,
    /// Terminal: failed after emitting chunks.
    PartiallyFailed,
    /// Terminal: cancelled by the control API or shutdown.
    Cancelled,
}

impl TaskState {
    /// Terminal states are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::PartiallyFailed
                | TaskState::Cancelled
        )
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Retrying)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, PartiallyFailed)
            | (Running, Cancelled) => true,
            (Retrying, Running) | (Retrying, Cancelled) => true,
            _ => false,
        }
    }
}

/// The mutable per-task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// UUID v4, textual form.
    pub task_id: String,
    /// Session the task streams to.
    pub session_id: String,
    /// Provider-qualified model name.
    pub model_name: String,
    /// Queue the task was routed to.
    pub queue: QueueName,
    /// Current lifecycle state.
    pub state: TaskState,
    /// 0-based attempt counter.
    pub attempt: u32,
    /// Kind of the most recent classified error, if any.
    pub last_error_kind: Option<ErrorKind>,
    /// Epoch seconds of the pending retry, while in `Retrying`.
    pub next_retry_at: Option<f64>,
    /// Epoch seconds the task was accepted.
    pub dispatched_at: f64,
    /// Label of the worker pool slot running the task.
    pub worker: Option<String>,
}

impl TaskRecord {
    /// A fresh `Pending` record for a submission.
    pub fn new(task_id: impl Into<String>, submission: &TaskSubmission) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: submission.session_id.clone(),
            model_name: submission.model_name.clone(),
            queue: submission.queue,
            state: TaskState::Pending,
            attempt: 0,
            last_error_kind: None,
            next_retry_at: None,
            dispatched_at: epoch_secs(),
            worker: None,
        }
    }
}

/// Shared handle to a task: snapshot reads, guarded transitions, and the
/// cancel signal.
pub struct TaskHandle {
    record: Mutex<TaskRecord>,
    finished_at: Mutex<Option<Instant>>,
    cancel_tx: watch::Sender<bool>,
}

impl TaskHandle {
    /// Wrap a record.
    pub fn new(record: TaskRecord) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            record: Mutex::new(record),
            finished_at: Mutex::new(None),
            cancel_tx,
        })
    }

    /// A point-in-time copy of the record.
    pub fn snapshot(&self) -> TaskRecord {
        self.record.lock().expect("task lock poisoned").clone()
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.record.lock().expect("task lock poisoned").state
    }

    /// Apply a transition if the table allows it. Returns whether it took
    /// effect. Illegal transitions (including anything out of a terminal
    /// state) are refused, not panicked on.
    pub fn transition(&self, to: TaskState) -> bool {
        let mut record = self.record.lock().expect("task lock poisoned");
        if !record.state.can_transition(to) {
            debug!(
                task_id = %record.task_id,
                from = ?record.state,
                to = ?to,
                "transition refused"
            );
            return false;
        }
        record.state = to;
        if to.is_terminal() {
            *self.finished_at.lock().expect("task lock poisoned") = Some(Instant::now());
        }
        true
    }

    /// Mutate non-state fields under the lock.
    pub(crate) fn update(&self, f: impl FnOnce(&mut TaskRecord)) {
        let mut record = self.record.lock().expect("task lock poisoned");
        f(&mut record);
    }

    /// Ask the owning worker to cancel. Returns `false` when the task is
    /// already terminal (nothing to cancel).
    pub fn request_cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.cancel_tx.send_replace(true);
        true
    }

    /// Whether a cancel has been requested.
    pub fn cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// The signal a worker selects on. One-way: `false` then at most one
    /// flip to `true`.
    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// How long ago the task reached a terminal state.
    fn finished_elapsed(&self) -> Option<Duration> {
        self.finished_at
            .lock()
            .expect("task lock poisoned")
            .map(|at| at.elapsed())
    }
}

/// All live task handles, keyed by task id. Terminal records are retained
/// for the result TTL, then pruned on access.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<TaskHandle>>>,
    retain: Duration,
}

impl TaskRegistry {
    /// Create a registry retaining terminal records for `retain`.
    pub fn new(retain: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            retain,
        }
    }

    /// Insert a handle. The task is queryable from this point on.
    pub fn insert(&self, handle: Arc<TaskHandle>) {
        let task_id = handle.snapshot().task_id;
        self.prune();
        self.tasks
            .lock()
            .expect("registry lock poisoned")
            .insert(task_id, handle);
    }

    /// Look up a handle.
    pub fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.prune();
        self.tasks
            .lock()
            .expect("registry lock poisoned")
            .get(task_id)
            .cloned()
    }

    /// Snapshots of all non-terminal tasks.
    pub fn active(&self) -> Vec<TaskRecord> {
        self.prune();
        let tasks = self.tasks.lock().expect("registry lock poisoned");
        let mut records: Vec<TaskRecord> = tasks
            .values()
            .map(|h| h.snapshot())
            .filter(|r| !r.state.is_terminal())
            .collect();
        records.sort_by(|a, b| a.dispatched_at.total_cmp(&b.dispatched_at));
        records
    }

    /// Number of registered tasks (terminal ones included until pruned).
    pub fn len(&self) -> usize {
        self.tasks.lock().expect("registry lock poisoned").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal records older than the retention window.
    fn prune(&self) {
        let retain = self.retain;
        self.tasks
            .lock()
            .expect("registry lock poisoned")
            .retain(|_, handle| match handle.finished_elapsed() {
                Some(elapsed) => elapsed < retain,
                None => true,
            });
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
