//! Typed stream events and their wire formats.
//!
//! Every event crossing the bus is a [`StreamEvent`]. Serialization is
//! internally tagged (`"type"` field, snake_case), which is also the JSON the
//! stream endpoint ships to clients. [`StreamEvent::to_sse`] renders one SSE
//! block: an `event:` tag line (omitted for plain `message` events), a
//! `data:` line with the JSON payload, and a blank-line terminator.

use crate::classify::ErrorKind;
use serde::{Deserialize, Serialize};

/// An event published on a stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First block a stream endpoint sends after attaching.
    Connected {
        /// The bus channel the subscriber attached to.
        channel: String,
    },
    /// A worker picked up the task and is about to stream.
    Start {
        /// Session the task belongs to.
        session_id: String,
        /// Provider-qualified model name.
        model: String,
        /// Epoch seconds.
        timestamp: f64,
    },
    /// One unit of streamed content.
    Chunk {
        /// The chunk text.
        content: String,
        /// Epoch seconds.
        timestamp: f64,
        /// Speaker label in observation mode.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        speaker: Option<String>,
    },
    /// The current attempt failed and another will follow after a delay.
    Retry {
        /// The upcoming attempt number (1-based over the wire).
        attempt: u32,
        /// The policy ceiling for this error kind.
        max_attempts: u32,
        /// Wait before the next attempt, in seconds.
        retry_delay_s: f64,
        /// Epoch seconds at which the retry fires.
        retry_at: f64,
        /// Classified kind of the failure that triggered the retry.
        error_kind: ErrorKind,
        /// Decision reason (`"retrying"`).
        reason: String,
    },
    /// The task streamed to completion.
    Complete {
        /// Full generated text, in emission order.
        total_content: String,
        /// Number of chunks streamed.
        token_count: u64,
        /// Wall time of the successful attempt, in seconds.
        response_time_s: f64,
        /// Speaker label in observation mode.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        speaker: Option<String>,
        /// `"{speaker}: {total_content}"`, observation mode only.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        formatted_content: Option<String>,
    },
    /// Retries are exhausted but partial output exists; a terminal `error`
    /// follows this event.
    PartialComplete {
        /// Reconstructed partial text.
        content: String,
        /// The final error message.
        error: String,
        /// Classified kind of the final error.
        error_kind: ErrorKind,
        /// Always `true`.
        partial: bool,
    },
    /// Terminal failure.
    Error {
        /// The error message.
        error: String,
        /// Classified kind.
        error_kind: ErrorKind,
        /// 0-based attempt the task died on.
        attempt: u32,
        /// Decision reason (`"permanent:..."` or `"max_retries_exceeded"`).
        reason: String,
    },
    /// The task was cancelled.
    Cancelled,
    /// Keep-alive from the stream endpoint.
    Heartbeat,
    /// The stream endpoint's overall deadline elapsed.
    Timeout,
}

impl StreamEvent {
    /// The wire name of the event type (the serialized `type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Start { .. } => "start",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Retry { .. } => "retry",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::PartialComplete { .. } => "partial_complete",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Cancelled => "cancelled",
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::Timeout => "timeout",
        }
    }

    /// Terminal events: exactly one ends every task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete { .. }
                | StreamEvent::PartialComplete { .. }
                | StreamEvent::Error { .. }
                | StreamEvent::Cancelled
                | StreamEvent::Timeout
        )
    }

    /// Whether no further events follow on the channel.
    ///
    /// `partial_complete` is terminal but does not end the stream: the final
    /// `error` event follows it.
    pub fn ends_stream(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete { .. }
                | StreamEvent::Error { .. }
                | StreamEvent::Cancelled
                | StreamEvent::Timeout
        )
    }

    /// Render this event as one SSE block.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        sse_block(self.kind(), &json)
    }
}

/// Format one SSE block. The `event:` tag line is omitted for the default
/// `message` type, matching the browser EventSource default.
pub fn sse_block(event_type: &str, json: &str) -> String {
    if event_type == "message" {
        format!("data: {}\n\n", json)
    } else {
        format!("event: {}\ndata: {}\n\n", event_type, json)
    }
}
