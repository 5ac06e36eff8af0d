//! Dispatcher: accepts submissions, routes them to named queues, and runs the
//! per-queue worker pools.
//!
//! Each queue gets an unbounded FIFO channel and a pump task. The pump spawns
//! one worker task per submission into a `JoinSet` bounded by the queue's
//! configured pool size, so a queue never runs more tasks than it has worker
//! slots (llm defaults to one: LLM calls are heavy). Priority across queues
//! is static metadata; weighting comes from pool sizing.
//!
//! Pumps report liveness into [`WorkerHealthMap`] for the health endpoint and
//! drain their running tasks on shutdown within the configured budget.

use crate::error::{RelayError, Result};
use crate::runtime::RelayCtx;
use crate::task::{TaskHandle, TaskRecord, TaskState};
use crate::types::{QueueName, TaskSubmission};
use crate::worker::run_task;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A task waiting in a queue.
struct QueuedTask {
    handle: Arc<TaskHandle>,
    submission: TaskSubmission,
}

/// Accepts dispatch requests and owns the queue pumps.
pub struct Dispatcher {
    ctx: Arc<RelayCtx>,
    senders: HashMap<QueueName, mpsc::UnboundedSender<QueuedTask>>,
    pumps: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    /// Start one pump per configured queue.
    pub fn new(ctx: Arc<RelayCtx>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut senders = HashMap::new();
        let mut pumps = Vec::new();
        for (&queue, &workers) in &ctx.config.queue_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(queue, tx);
            pumps.push(tokio::spawn(queue_pump(
                ctx.clone(),
                queue,
                workers,
                rx,
                shutdown_tx.subscribe(),
            )));
        }
        Self {
            ctx,
            senders,
            pumps,
            shutdown_tx,
        }
    }

    /// Accept a submission and return its task id immediately. The task is
    /// queryable via the control API from the moment this returns; the caller
    /// then subscribes to `stream:{session_id}`.
    pub fn dispatch(&self, submission: TaskSubmission) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let handle = TaskHandle::new(TaskRecord::new(task_id.clone(), &submission));
        self.ctx.registry.insert(handle.clone());

        let sender = match self.senders.get(&submission.queue) {
            Some(sender) => sender,
            None => {
                handle.transition(TaskState::Cancelled);
                return Err(RelayError::QueueClosed(submission.queue.to_string()));
            }
        };
        let queue = submission.queue;
        if sender.send(QueuedTask { handle: handle.clone(), submission }).is_err() {
            handle.transition(TaskState::Cancelled);
            return Err(RelayError::QueueClosed(queue.to_string()));
        }
        debug!(task_id = %task_id, queue = %queue, "task dispatched");
        Ok(task_id)
    }

    /// Shared runtime context (bus, store, registry) for wiring up the
    /// control API and stream endpoints.
    pub fn ctx(&self) -> &Arc<RelayCtx> {
        &self.ctx
    }

    /// Signal every worker to stop and drain in-flight tasks within the
    /// configured budget. Workers persist in-flight partials before exiting.
    pub async fn shutdown(self) {
        let drain = self.ctx.config.drain_timeout;
        info!(drain_s = drain.as_secs(), "dispatcher shutting down");
        self.shutdown_tx.send_replace(true);
        drop(self.senders);

        let pumps = self.pumps;
        let join_all = async {
            for pump in pumps {
                let _ = pump.await;
            }
        };
        if tokio::time::timeout(drain, join_all).await.is_err() {
            warn!("drain budget exceeded, abandoning in-flight tasks");
        }
    }
}

/// One queue's pump: pulls FIFO, spawns workers, keeps at most `workers`
/// running, beats the health map, and drains on shutdown.
async fn queue_pump(
    ctx: Arc<RelayCtx>,
    queue: QueueName,
    workers: usize,
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    mut shutdown: watch::Receiver<bool>,
) {
    let label = format!("{}-pump", queue);
    info!(queue = %queue, workers = workers, "queue pump started");

    let mut join_set: JoinSet<()> = JoinSet::new();
    let mut beat = tokio::time::interval(ctx.config.worker_heartbeat);
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown_open = true;

    loop {
        ctx.workers.beat(&label, queue);
        if *shutdown.borrow() {
            break;
        }

        if join_set.len() >= workers {
            // Pool full: wait for a slot, keep beating.
            tokio::select! {
                _ = join_set.join_next() => {}
                _ = beat.tick() => {}
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    }
                }
            }
            continue;
        }

        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(task) => {
                    let worker_label = format!("{}-{}", queue, join_set.len());
                    join_set.spawn(run_task(
                        ctx.clone(),
                        task.handle,
                        task.submission,
                        worker_label,
                        shutdown.clone(),
                    ));
                }
                None => break,
            },
            _ = join_set.join_next(), if !join_set.is_empty() => {}
            _ = beat.tick() => {}
            changed = shutdown.changed(), if shutdown_open => {
                if changed.is_err() {
                    shutdown_open = false;
                }
            }
        }
    }

    // Running tasks see the shutdown signal themselves; wait them out.
    while join_set.join_next().await.is_some() {}
    ctx.workers.remove(&label);
    info!(queue = %queue, "queue pump stopped");
}

/// Liveness of one pump, as reported to the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// Pump label (`"llm-pump"`).
    pub name: String,
    /// The queue it serves.
    pub queue: QueueName,
    /// Whether it beat within the staleness window.
    pub healthy: bool,
    /// Seconds since the last beat.
    pub last_seen_s: f64,
}

struct WorkerBeat {
    queue: QueueName,
    last_seen: Instant,
}

/// Last-seen heartbeats of the queue pumps.
pub struct WorkerHealthMap {
    stale_after: Duration,
    entries: Mutex<HashMap<String, WorkerBeat>>,
}

impl WorkerHealthMap {
    /// Create a map with the given staleness window.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a beat.
    pub(crate) fn beat(&self, name: &str, queue: QueueName) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        entries.insert(
            name.to_string(),
            WorkerBeat {
                queue,
                last_seen: Instant::now(),
            },
        );
    }

    /// Forget a pump that exited cleanly.
    pub(crate) fn remove(&self, name: &str) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        entries.remove(name);
    }

    /// Snapshot of every known pump, sorted by name.
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        let entries = self.entries.lock().expect("health lock poisoned");
        let mut statuses: Vec<WorkerStatus> = entries
            .iter()
            .map(|(name, beat)| {
                let elapsed = beat.last_seen.elapsed();
                WorkerStatus {
                    name: name.clone(),
                    queue: beat.queue,
                    healthy: elapsed < self.stale_after,
                    last_seen_s: elapsed.as_secs_f64(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use crate::config::RelayConfig;
    use crate::provider::{MockProvider, Provider};
    use crate::retry::{RetryConfig, RetryPolicy};
    use crate::store::reconstruct;
    use crate::types::Message;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RelayConfig {
        let fast = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            backoff_factor: 1.0,
            jitter: false,
        };
        RelayConfig::default()
            .with_retry_policy(
                RetryPolicy::default()
                    .with_config(ErrorKind::Network, fast.clone())
                    .with_default(fast),
            )
            .with_attempt_timeouts(Duration::from_secs(30), Duration::from_secs(60))
    }

    fn submission(session: &str) -> TaskSubmission {
        TaskSubmission::new(
            session,
            "gemini/gemini-1.5-flash",
            vec![Message::user("Hello")],
        )
    }

    async fn wait_terminal(ctx: &Arc<RelayCtx>, task_id: &str) -> TaskState {
        for _ in 0..500 {
            if let Some(handle) = ctx.registry.get(task_id) {
                let state = handle.state();
                if state.is_terminal() {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }

    #[tokio::test]
    async fn test_dispatch_is_immediately_queryable() {
        let ctx = RelayCtx::builder()
            .config(fast_config())
            .provider("gemini", Arc::new(MockProvider::streaming(vec!["ok".into()])))
            .build();
        let dispatcher = Dispatcher::new(ctx.clone());

        let task_id = dispatcher.dispatch(submission("s1")).unwrap();
        // Queryable before any worker has touched it.
        assert!(ctx.registry.get(&task_id).is_some());

        assert_eq!(wait_terminal(&ctx, &task_id).await, TaskState::Succeeded);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_queue_is_refused() {
        let mut config = fast_config();
        config.queue_workers = BTreeMap::from([(QueueName::Llm, 1)]);
        let ctx = RelayCtx::builder()
            .config(config)
            .provider("gemini", Arc::new(MockProvider::streaming(vec!["ok".into()])))
            .build();
        let dispatcher = Dispatcher::new(ctx.clone());

        let err = dispatcher
            .dispatch(submission("s1").with_queue(QueueName::Quick))
            .unwrap_err();
        assert!(matches!(err, RelayError::QueueClosed(_)));
        dispatcher.shutdown().await;
    }

    /// Provider that records how many calls overlap.
    #[derive(Debug)]
    struct ConcurrencyProbe {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Provider for ConcurrencyProbe {
        async fn stream_chat(
            &self,
            _model: &str,
            _messages: &[Message],
            on_chunk: &mut (dyn FnMut(String) + Send),
        ) -> crate::error::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            on_chunk("ok".to_string());
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "probe"
        }
    }

    #[tokio::test]
    async fn test_llm_queue_runs_one_task_at_a_time() {
        let probe = Arc::new(ConcurrencyProbe {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let ctx = RelayCtx::builder()
            .config(fast_config())
            .provider("gemini", probe.clone())
            .build();
        let dispatcher = Dispatcher::new(ctx.clone());

        let ids: Vec<String> = (0..3)
            .map(|i| dispatcher.dispatch(submission(&format!("s{}", i))).unwrap())
            .collect();
        for id in &ids {
            assert_eq!(wait_terminal(&ctx, id).await, TaskState::Succeeded);
        }
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1, "llm pool must not overlap");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_quick_queue_runs_concurrently() {
        let probe = Arc::new(ConcurrencyProbe {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let ctx = RelayCtx::builder()
            .config(fast_config())
            .provider("gemini", probe.clone())
            .build();
        let dispatcher = Dispatcher::new(ctx.clone());

        let ids: Vec<String> = (0..4)
            .map(|i| {
                dispatcher
                    .dispatch(submission(&format!("q{}", i)).with_queue(QueueName::Quick))
                    .unwrap()
            })
            .collect();
        for id in &ids {
            assert_eq!(wait_terminal(&ctx, id).await, TaskState::Succeeded);
        }
        assert!(
            probe.peak.load(Ordering::SeqCst) > 1,
            "quick pool should overlap"
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_and_persists_partial() {
        let ctx = RelayCtx::builder()
            .config(fast_config())
            .provider(
                "gemini",
                Arc::new(MockProvider::new(vec![
                    crate::provider::MockOutcome::Stall(vec!["partial".into()]),
                ])),
            )
            .build();
        let dispatcher = Dispatcher::new(ctx.clone());

        let task_id = dispatcher.dispatch(submission("s-drain")).unwrap();

        // Let the worker reach the stall with one chunk staged.
        let mut events = ctx.bus.subscribe("stream:s-drain");
        loop {
            match events.recv().await {
                Some(event) if event.kind() == "chunk" => break,
                Some(_) => continue,
                None => panic!("stream closed before first chunk"),
            }
        }

        dispatcher.shutdown().await;

        let handle = ctx.registry.get(&task_id).expect("record retained");
        assert_eq!(handle.state(), TaskState::Cancelled);
        let record = ctx
            .store
            .read(&task_id)
            .await
            .unwrap()
            .expect("partial persisted on drain");
        assert_eq!(reconstruct(&record.chunks), "partial");
    }

    #[tokio::test]
    async fn test_pumps_report_health() {
        let ctx = RelayCtx::builder().config(fast_config()).build();
        let dispatcher = Dispatcher::new(ctx.clone());

        // Give the pumps a moment to start and beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let statuses = ctx.workers.statuses();
        assert_eq!(statuses.len(), ctx.config.queue_workers.len());
        assert!(statuses.iter().all(|s| s.healthy));

        dispatcher.shutdown().await;
        assert!(ctx.workers.statuses().is_empty());
    }
}
