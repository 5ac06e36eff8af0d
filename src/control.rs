//! Task control API: status, cancel, partial reads, and introspection.
//!
//! Everything here is read-mostly and safe to call from HTTP handlers; the
//! view structs serialize straight to the wire shapes. Only `cancel` writes:
//! it signals the owning worker and drops the partial record.

use crate::classify::ErrorKind;
use crate::dispatcher::WorkerStatus;
use crate::runtime::RelayCtx;
use crate::store::reconstruct;
use crate::task::{TaskRecord, TaskState};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Point-in-time view of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// The task id queried.
    pub task_id: String,
    /// Lifecycle state.
    pub state: TaskState,
    /// Whether the task reached a terminal state.
    pub ready: bool,
    /// Terminal and succeeded.
    pub successful: bool,
    /// Terminal and failed (fully or partially).
    pub failed: bool,
    /// Retry and partial-response sub-status.
    pub retry_status: RetryStatus,
}

/// The retry half of a task's status.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatus {
    /// 0-based attempt counter.
    pub attempt: u32,
    /// Kind of the last classified error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
    /// Epoch seconds of the pending retry, while waiting out a backoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<f64>,
    /// Whether a partial response is stored for the task.
    pub has_partial: bool,
    /// Chunk count of the stored partial, 0 when absent.
    pub partial_chunks: usize,
    /// Epoch seconds the partial was saved, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<f64>,
}

/// Reconstructed partial response, ready for the wire.
#[derive(Debug, Clone, Serialize)]
pub struct PartialView {
    /// The owning task.
    pub task_id: String,
    /// Chunks joined in `chunk_index` order.
    pub content: String,
    /// Number of stored chunks.
    pub chunks_count: usize,
    /// Epoch seconds the record was saved.
    pub saved_at: f64,
    /// Context captured at persist time.
    pub metadata: serde_json::Value,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The worker was signalled; the task will end `Cancelled`.
    Accepted,
    /// The task already reached a terminal state; nothing to cancel.
    AlreadyTerminal(TaskState),
    /// No such task (unknown id, or pruned after the result TTL).
    NotFound,
}

/// Active-task listing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTasks {
    /// Non-terminal task records, oldest first.
    pub tasks: Vec<TaskRecord>,
    /// Count of the above.
    pub total: usize,
}

/// Roll-up of worker liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every pump beat within the window.
    Healthy,
    /// At least one pump is stale (all of them stale still counts here:
    /// something is registered and may recover).
    Degraded,
    /// No pumps registered at all.
    Unhealthy,
}

/// The health endpoint payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall roll-up.
    pub health_status: HealthStatus,
    /// Total pumps known.
    pub total_workers: usize,
    /// Pumps that beat within the window.
    pub healthy_workers: usize,
    /// Pumps that did not.
    pub unhealthy_workers: usize,
    /// Per-pump detail.
    pub workers: Vec<WorkerStatus>,
}

/// Query and control surface over the task registry and partial store.
pub struct TaskControl {
    ctx: Arc<RelayCtx>,
}

impl TaskControl {
    /// Wrap a runtime context.
    pub fn new(ctx: Arc<RelayCtx>) -> Self {
        Self { ctx }
    }

    /// Status of one task, or `None` for unknown ids (the HTTP layer's 404).
    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let handle = self.ctx.registry.get(task_id)?;
        let record = handle.snapshot();
        let partial = self.ctx.store.read(task_id).await.ok().flatten();

        Some(TaskStatus {
            task_id: record.task_id.clone(),
            state: record.state,
            ready: record.state.is_terminal(),
            successful: record.state == TaskState::Succeeded,
            failed: matches!(
                record.state,
                TaskState::Failed | TaskState::PartiallyFailed
            ),
            retry_status: RetryStatus {
                attempt: record.attempt,
                last_error_kind: record.last_error_kind,
                next_retry_at: record.next_retry_at,
                has_partial: partial.is_some(),
                partial_chunks: partial.as_ref().map(|p| p.total_chunks).unwrap_or(0),
                saved_at: partial.map(|p| p.saved_at),
            },
        })
    }

    /// Cancel a task: signal the worker and drop the partial record.
    /// Refused for terminal tasks; `NotFound` for unknown ids.
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let handle = match self.ctx.registry.get(task_id) {
            Some(handle) => handle,
            None => return CancelOutcome::NotFound,
        };
        if !handle.request_cancel() {
            return CancelOutcome::AlreadyTerminal(handle.state());
        }
        if let Err(err) = self.ctx.store.delete(task_id).await {
            tracing::warn!(task_id = %task_id, error = %err, "partial delete failed on cancel");
        }
        info!(task_id = %task_id, "cancel requested");
        CancelOutcome::Accepted
    }

    /// The stored partial response, reconstructed. `None` when absent or
    /// expired (the HTTP layer's 404).
    pub async fn partial(&self, task_id: &str) -> Option<PartialView> {
        let record = self.ctx.store.read(task_id).await.ok().flatten()?;
        Some(PartialView {
            task_id: record.task_id.clone(),
            content: reconstruct(&record.chunks),
            chunks_count: record.total_chunks,
            saved_at: record.saved_at,
            metadata: record.metadata,
        })
    }

    /// All non-terminal tasks, oldest first.
    pub fn list_active(&self) -> ActiveTasks {
        let tasks = self.ctx.registry.active();
        let total = tasks.len();
        ActiveTasks { tasks, total }
    }

    /// Worker liveness roll-up.
    pub fn health(&self) -> HealthReport {
        let workers = self.ctx.workers.statuses();
        let total_workers = workers.len();
        let healthy_workers = workers.iter().filter(|w| w.healthy).count();
        let unhealthy_workers = total_workers - healthy_workers;

        let health_status = if total_workers == 0 {
            HealthStatus::Unhealthy
        } else if unhealthy_workers > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            health_status,
            total_workers,
            healthy_workers,
            unhealthy_workers,
            workers,
        }
    }
}
