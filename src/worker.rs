//! The worker: runs one task end to end.
//!
//! A worker streams provider chunks onto the bus, stages them for partial
//! preservation, and on failure routes the error through classify → policy.
//! The retry loop is an explicit state machine: classification and the retry
//! decision are pure, the only side-effectful step is the interruptible wait.
//! Provider errors never propagate past this module; they end as events and
//! a terminal task state.
//!
//! Suspension points (provider pull, publish, persist, backoff sleep) are all
//! cancellation-aware: a cancel or shutdown signal lands within a second.

use crate::bus::stream_channel;
use crate::classify::classify;
use crate::error::RelayError;
use crate::event::StreamEvent;
use crate::provider::Provider;
use crate::runtime::RelayCtx;
use crate::store::{reconstruct, ChunkTracker, PartialRecord};
use crate::task::{TaskHandle, TaskState};
use crate::types::{epoch_secs, Chunk, TaskSubmission};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

/// How one attempt ended.
enum AttemptOutcome {
    /// The provider stream finished cleanly.
    Completed,
    /// The provider or a deadline failed the attempt.
    Failed(RelayError),
    /// The control API cancelled the task.
    Cancelled,
    /// The process is shutting down.
    Shutdown,
}

/// Run a task to its terminal state. Consumes exactly one task; the pump
/// enforces that a worker slot never pipelines.
pub(crate) async fn run_task(
    ctx: Arc<RelayCtx>,
    handle: Arc<TaskHandle>,
    submission: TaskSubmission,
    worker_label: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let task_id = handle.snapshot().task_id;
    let channel = stream_channel(&submission.session_id);
    let mut cancel = handle.cancel_signal();

    // Cancelled (or shutting down) before pickup: nothing streamed yet.
    if *cancel.borrow() || *shutdown.borrow() {
        if handle.transition(TaskState::Cancelled) {
            ctx.bus.publish(&channel, StreamEvent::Cancelled);
        }
        return;
    }
    if !handle.transition(TaskState::Running) {
        return;
    }
    handle.update(|r| r.worker = Some(worker_label));

    info!(
        task_id = %task_id,
        model = %submission.model_name,
        queue = %submission.queue,
        "task started"
    );

    ctx.bus.publish(
        &channel,
        StreamEvent::Start {
            session_id: submission.session_id.clone(),
            model: submission.model_name.clone(),
            timestamp: epoch_secs(),
        },
    );

    let speaker: Option<String> = submission.speaker().map(str::to_string);
    let tracker = Arc::new(Mutex::new(ChunkTracker::new()));
    let mut attempt: u32 = 0;

    loop {
        let attempt_started = Instant::now();

        let outcome = match ctx.providers.resolve(&submission.model_name) {
            Ok((provider, model_id)) => {
                run_attempt(
                    &ctx,
                    provider.as_ref(),
                    &model_id,
                    &submission,
                    &tracker,
                    &channel,
                    speaker.as_deref(),
                    &mut cancel,
                    &mut shutdown,
                )
                .await
            }
            Err(err) => AttemptOutcome::Failed(err),
        };

        match outcome {
            AttemptOutcome::Completed => {
                let (total_content, token_count) = {
                    let staged = tracker.lock().expect("tracker lock poisoned");
                    (reconstruct(staged.chunks()), staged.len() as u64)
                };
                let formatted_content = speaker
                    .as_deref()
                    .map(|s| format!("{}: {}", s, total_content));
                ctx.bus.publish(
                    &channel,
                    StreamEvent::Complete {
                        total_content,
                        token_count,
                        response_time_s: attempt_started.elapsed().as_secs_f64(),
                        speaker: speaker.clone(),
                        formatted_content,
                    },
                );
                if let Err(err) = ctx.store.delete(&task_id).await {
                    warn!(task_id = %task_id, error = %err, "partial delete failed after success");
                }
                handle.transition(TaskState::Succeeded);
                info!(task_id = %task_id, chunks = token_count, "task succeeded");
                return;
            }

            AttemptOutcome::Cancelled => {
                cancel_cleanup(&ctx, &handle, &channel, &task_id).await;
                return;
            }

            AttemptOutcome::Shutdown => {
                drain_cleanup(&ctx, &handle, &tracker, &channel, &task_id, attempt).await;
                return;
            }

            AttemptOutcome::Failed(err) => {
                let classified = classify(&err);
                handle.update(|r| r.last_error_kind = Some(classified.kind));
                warn!(
                    task_id = %task_id,
                    attempt = attempt,
                    error_kind = %classified.kind,
                    error = %classified.message,
                    "attempt failed"
                );

                let staged_chunks: Vec<Chunk> = {
                    let staged = tracker.lock().expect("tracker lock poisoned");
                    staged.chunks().to_vec()
                };

                // Preserve what this attempt produced before deciding anything.
                if !staged_chunks.is_empty() {
                    let record = PartialRecord::new(
                        task_id.clone(),
                        staged_chunks.clone(),
                        json!({
                            "error_occurred": true,
                            "attempt": attempt,
                            "error_kind": classified.kind.to_string(),
                            "error": classified.message,
                        }),
                    );
                    if let Err(store_err) = ctx.store.persist(record).await {
                        warn!(
                            task_id = %task_id,
                            error = %store_err,
                            "partial persist failed, continuing without preservation"
                        );
                    }
                }

                let (retry, reason) = ctx.config.retry.should_retry(&classified, attempt);

                if !retry {
                    if !staged_chunks.is_empty() {
                        ctx.bus.publish(
                            &channel,
                            StreamEvent::PartialComplete {
                                content: reconstruct(&staged_chunks),
                                error: classified.message.clone(),
                                error_kind: classified.kind,
                                partial: true,
                            },
                        );
                    }
                    ctx.bus.publish(
                        &channel,
                        StreamEvent::Error {
                            error: classified.message.clone(),
                            error_kind: classified.kind,
                            attempt,
                            reason: reason.clone(),
                        },
                    );
                    let final_state = if staged_chunks.is_empty() {
                        TaskState::Failed
                    } else {
                        TaskState::PartiallyFailed
                    };
                    handle.transition(final_state);
                    info!(
                        task_id = %task_id,
                        state = ?final_state,
                        reason = %reason,
                        "task failed"
                    );
                    return;
                }

                let delay = ctx.config.retry.delay_for_attempt(&classified, attempt);
                let max_attempts = ctx.config.retry.config_for(classified.kind).max_retries;
                let retry_at = epoch_secs() + delay.as_secs_f64();
                handle.transition(TaskState::Retrying);
                handle.update(|r| r.next_retry_at = Some(retry_at));
                ctx.bus.publish(
                    &channel,
                    StreamEvent::Retry {
                        attempt: attempt + 1,
                        max_attempts,
                        retry_delay_s: delay.as_secs_f64(),
                        retry_at,
                        error_kind: classified.kind,
                        reason,
                    },
                );

                // Interruptible backoff sleep.
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                let mut cancel_open = true;
                let mut shutdown_open = true;
                loop {
                    if *cancel.borrow() {
                        cancel_cleanup(&ctx, &handle, &channel, &task_id).await;
                        return;
                    }
                    if *shutdown.borrow() {
                        drain_cleanup(&ctx, &handle, &tracker, &channel, &task_id, attempt).await;
                        return;
                    }
                    tokio::select! {
                        _ = &mut sleep => break,
                        changed = cancel.changed(), if cancel_open => {
                            if changed.is_err() {
                                cancel_open = false;
                            }
                        }
                        changed = shutdown.changed(), if shutdown_open => {
                            if changed.is_err() {
                                shutdown_open = false;
                            }
                        }
                    }
                }

                attempt += 1;
                handle.update(|r| {
                    r.attempt = attempt;
                    r.next_retry_at = None;
                });
                // Chunks from the failed attempt are discarded for the next
                // attempt; the provider regenerates. The persisted record
                // stays available in case the next attempt also fails.
                tracker.lock().expect("tracker lock poisoned").clear();
                handle.transition(TaskState::Running);
            }
        }
    }
}

/// One provider attempt under the soft/hard deadlines, reacting to cancel and
/// shutdown between pulls.
#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    ctx: &RelayCtx,
    provider: &dyn Provider,
    model_id: &str,
    submission: &TaskSubmission,
    tracker: &Arc<Mutex<ChunkTracker>>,
    channel: &str,
    speaker: Option<&str>,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> AttemptOutcome {
    if *cancel.borrow() {
        return AttemptOutcome::Cancelled;
    }
    if *shutdown.borrow() {
        return AttemptOutcome::Shutdown;
    }

    let bus = &ctx.bus;
    let staging = tracker.clone();
    let mut on_chunk = move |content: String| {
        {
            let mut staged = staging.lock().expect("tracker lock poisoned");
            staged.push(&content, speaker);
        }
        bus.publish(
            channel,
            StreamEvent::Chunk {
                content,
                timestamp: epoch_secs(),
                speaker: speaker.map(str::to_string),
            },
        );
    };

    let stream = provider.stream_chat(model_id, &submission.messages, &mut on_chunk);
    tokio::pin!(stream);

    let hard = tokio::time::sleep(ctx.config.hard_attempt_timeout);
    tokio::pin!(hard);
    let soft = tokio::time::sleep(ctx.config.soft_attempt_timeout);
    tokio::pin!(soft);
    let mut soft_fired = false;
    let mut cancel_open = true;
    let mut shutdown_open = true;

    loop {
        tokio::select! {
            result = &mut stream => {
                return match result {
                    Ok(()) => AttemptOutcome::Completed,
                    Err(err) => AttemptOutcome::Failed(err),
                };
            }
            _ = &mut hard => {
                return AttemptOutcome::Failed(RelayError::AttemptTimeout(
                    ctx.config.hard_attempt_timeout,
                ));
            }
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                warn!(channel = %channel, "attempt exceeded soft deadline");
            }
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel.borrow() => return AttemptOutcome::Cancelled,
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                }
            }
            changed = shutdown.changed(), if shutdown_open => {
                match changed {
                    Ok(()) if *shutdown.borrow() => return AttemptOutcome::Shutdown,
                    Ok(()) => {}
                    Err(_) => shutdown_open = false,
                }
            }
        }
    }
}

/// Explicit cancel: discard in-flight chunks, drop the partial record, end
/// the stream.
async fn cancel_cleanup(ctx: &RelayCtx, handle: &TaskHandle, channel: &str, task_id: &str) {
    if let Err(err) = ctx.store.delete(task_id).await {
        warn!(task_id = %task_id, error = %err, "partial delete failed on cancel");
    }
    if handle.transition(TaskState::Cancelled) {
        ctx.bus.publish(channel, StreamEvent::Cancelled);
    }
    info!(task_id = %task_id, "task cancelled");
}

/// Shutdown: preserve in-flight chunks (best-effort), then end the stream.
async fn drain_cleanup(
    ctx: &RelayCtx,
    handle: &TaskHandle,
    tracker: &Arc<Mutex<ChunkTracker>>,
    channel: &str,
    task_id: &str,
    attempt: u32,
) {
    let staged_chunks: Vec<Chunk> = {
        let staged = tracker.lock().expect("tracker lock poisoned");
        staged.chunks().to_vec()
    };
    if !staged_chunks.is_empty() {
        let record = PartialRecord::new(
            task_id.to_string(),
            staged_chunks,
            json!({"error_occurred": false, "shutdown": true, "attempt": attempt}),
        );
        if let Err(err) = ctx.store.persist(record).await {
            warn!(task_id = %task_id, error = %err, "partial persist failed on shutdown");
        }
    }
    if handle.transition(TaskState::Cancelled) {
        ctx.bus.publish(channel, StreamEvent::Cancelled);
    }
    info!(task_id = %task_id, "task stopped for shutdown");
}
