//! # LLM Relay
//!
//! Async task relay for streamed LLM chat completions. Sits between a web
//! front-end and remote LLM providers: accepts a request for a streamed
//! completion, dispatches it onto a priority queue, streams token chunks back
//! over a pub/sub bus to long-lived SSE connections, classifies provider
//! failures, retries with backoff, and preserves partial output across
//! retries so the client can still show something on final failure.
//!
//! ## Core Concepts
//!
//! - **[`RelayCtx`]** — the runtime context (bus, store, providers, config),
//!   constructed once and threaded through everything.
//! - **[`Dispatcher`]** — accepts [`TaskSubmission`]s, routes them to named
//!   queues, and runs the per-queue worker pools.
//! - **[`StreamBus`]** — named-channel fan-out from workers to subscribers.
//! - **[`stream_events`]** — turns a channel subscription into SSE blocks for
//!   an HTTP response body.
//! - **[`TaskControl`]** — status, cancel, partial reads, worker health.
//! - **[`Provider`]** — the narrow seam to an LLM backend:
//!   `stream_chat(model, messages, on_chunk)`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_relay::{
//!     stream_events, Dispatcher, Message, RelayCtx, StreamOptions, TaskSubmission,
//! };
//! use llm_relay::provider::OpenAiCompatProvider;
//! use std::sync::Arc;
//!
//! # async fn run() -> llm_relay::Result<()> {
//! let ctx = RelayCtx::builder()
//!     .provider(
//!         "gemini",
//!         Arc::new(
//!             OpenAiCompatProvider::new("https://generativelanguage.googleapis.com")
//!                 .with_api_key(std::env::var("GOOGLE_API_KEY").unwrap_or_default()),
//!         ),
//!     )
//!     .build();
//! let dispatcher = Dispatcher::new(ctx.clone());
//!
//! let task_id = dispatcher.dispatch(TaskSubmission::new(
//!     "session-1",
//!     "gemini/gemini-1.5-flash",
//!     vec![Message::user("Hello")],
//! ))?;
//!
//! // The HTTP layer plugs this straight into a text/event-stream body.
//! let body = stream_events(&ctx.bus, "stream:session-1", StreamOptions::default());
//! # let _ = (task_id, body);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod classify;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod task;
pub mod types;

mod worker;

pub use bus::{stream_channel, EventSubscription, StreamBus};
pub use classify::{classify, ClassifiedError, ErrorKind};
pub use config::RelayConfig;
pub use control::{
    ActiveTasks, CancelOutcome, HealthReport, HealthStatus, PartialView, RetryStatus, TaskControl,
    TaskStatus,
};
pub use dispatcher::{Dispatcher, WorkerHealthMap, WorkerStatus};
pub use endpoint::{stream_events, StreamOptions};
pub use error::{RelayError, Result};
pub use event::StreamEvent;
pub use provider::{MockProvider, OpenAiCompatProvider, Provider, ProviderRegistry};
pub use retry::{RetryConfig, RetryPolicy};
pub use runtime::{RelayCtx, RelayCtxBuilder};
pub use store::{reconstruct, ChunkTracker, MemoryPartialStore, PartialRecord, PartialStore};
pub use task::{TaskHandle, TaskRecord, TaskRegistry, TaskState};
pub use types::{Chunk, Message, QueueName, Role, TaskSubmission};
