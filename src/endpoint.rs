//! Stream endpoint: bridges a bus channel to an SSE response body.
//!
//! [`stream_events`] yields ready-to-write SSE blocks: a `connected` block
//! first, then every bus event in order, heartbeats when nothing real has
//! flowed for a while, and a final `timeout` block if the overall deadline
//! elapses. The stream finishes after the channel's stream-ending event.
//!
//! Client disconnect is just the consumer dropping the stream; it detaches
//! the subscriber and nothing else — other subscribers (audit, a reconnected
//! tab) keep receiving, and the underlying task keeps running.
//!
//! The HTTP layer owns the response plumbing; [`RESPONSE_HEADERS`] lists the
//! headers an SSE response needs.

use crate::bus::{EventSubscription, StreamBus};
use crate::event::StreamEvent;
use futures::Stream;
use std::time::Duration;

/// `Content-Type` for SSE responses.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// The headers an SSE response should carry. `X-Accel-Buffering: no` keeps
/// nginx from buffering the stream.
pub const RESPONSE_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", CONTENT_TYPE),
    ("Cache-Control", "no-cache"),
    ("X-Accel-Buffering", "no"),
    ("Connection", "keep-alive"),
];

/// Per-request knobs, usually from query parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Overall deadline for the stream.
    pub timeout: Duration,
    /// Emit a heartbeat after this long without a real event.
    pub heartbeat: Duration,
}

impl StreamOptions {
    /// Explicit values.
    pub fn new(timeout: Duration, heartbeat: Duration) -> Self {
        Self { timeout, heartbeat }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            heartbeat: Duration::from_secs(15),
        }
    }
}

enum StreamStep {
    Event(StreamEvent),
    Heartbeat,
    TimedOut,
    Closed,
}

async fn next_step(
    subscription: &mut EventSubscription,
    deadline: &mut std::pin::Pin<&mut tokio::time::Sleep>,
    heartbeat: Duration,
) -> StreamStep {
    tokio::select! {
        event = subscription.recv() => match event {
            Some(event) => StreamStep::Event(event),
            None => StreamStep::Closed,
        },
        _ = deadline.as_mut() => StreamStep::TimedOut,
        _ = tokio::time::sleep(heartbeat) => StreamStep::Heartbeat,
    }
}

/// Attach to a channel and stream SSE blocks until the task's stream ends,
/// the overall timeout fires, or the consumer drops the stream.
pub fn stream_events(
    bus: &StreamBus,
    channel: &str,
    options: StreamOptions,
) -> impl Stream<Item = String> + Send {
    let mut subscription = bus.subscribe(channel);
    let channel = channel.to_string();

    async_stream::stream! {
        yield StreamEvent::Connected {
            channel: channel.clone(),
        }
        .to_sse();

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        loop {
            let step = next_step(&mut subscription, &mut deadline, options.heartbeat).await;
            match step {
                StreamStep::Event(event) => {
                    let ends = event.ends_stream();
                    yield event.to_sse();
                    if ends {
                        break;
                    }
                }
                StreamStep::Heartbeat => {
                    yield StreamEvent::Heartbeat.to_sse();
                }
                StreamStep::TimedOut => {
                    yield StreamEvent::Timeout.to_sse();
                    break;
                }
                StreamStep::Closed => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use futures::StreamExt;

    fn chunk(content: &str) -> StreamEvent {
        StreamEvent::Chunk {
            content: content.to_string(),
            timestamp: 0.0,
            speaker: None,
        }
    }

    fn complete() -> StreamEvent {
        StreamEvent::Complete {
            total_content: "done".into(),
            token_count: 1,
            response_time_s: 0.1,
            speaker: None,
            formatted_content: None,
        }
    }

    fn event_type(block: &str) -> String {
        block
            .lines()
            .find_map(|line| line.strip_prefix("event: "))
            .unwrap_or("message")
            .to_string()
    }

    #[tokio::test]
    async fn test_connected_block_comes_first() {
        let bus = StreamBus::default();
        let stream = stream_events(&bus, "stream:s1", StreamOptions::default());
        tokio::pin!(stream);
        bus.publish("stream:s1", complete());

        let first = stream.next().await.unwrap();
        assert_eq!(event_type(&first), "connected");
        assert!(first.contains("stream:s1"));
    }

    #[tokio::test]
    async fn test_forwards_events_and_closes_on_complete() {
        let bus = StreamBus::default();
        let stream = stream_events(&bus, "stream:s1", StreamOptions::default());
        bus.publish("stream:s1", chunk("a"));
        bus.publish("stream:s1", chunk("b"));
        bus.publish("stream:s1", complete());

        let blocks: Vec<String> = stream.collect().await;
        let types: Vec<String> = blocks.iter().map(|b| event_type(b)).collect();
        assert_eq!(types, vec!["connected", "chunk", "chunk", "complete"]);
    }

    #[tokio::test]
    async fn test_partial_complete_then_error_both_forwarded() {
        let bus = StreamBus::default();
        let stream = stream_events(&bus, "stream:s1", StreamOptions::default());
        bus.publish(
            "stream:s1",
            StreamEvent::PartialComplete {
                content: "par".into(),
                error: "reset".into(),
                error_kind: ErrorKind::Network,
                partial: true,
            },
        );
        bus.publish(
            "stream:s1",
            StreamEvent::Error {
                error: "reset".into(),
                error_kind: ErrorKind::Network,
                attempt: 4,
                reason: "max_retries_exceeded".into(),
            },
        );

        let blocks: Vec<String> = stream.collect().await;
        let types: Vec<String> = blocks.iter().map(|b| event_type(b)).collect();
        assert_eq!(types, vec!["connected", "partial_complete", "error"]);
    }

    #[tokio::test]
    async fn test_heartbeats_when_idle() {
        let bus = StreamBus::default();
        let options = StreamOptions::new(Duration::from_secs(5), Duration::from_millis(10));
        let stream = stream_events(&bus, "stream:s1", options);
        tokio::pin!(stream);

        assert_eq!(event_type(&stream.next().await.unwrap()), "connected");
        assert_eq!(event_type(&stream.next().await.unwrap()), "heartbeat");
        assert_eq!(event_type(&stream.next().await.unwrap()), "heartbeat");
    }

    #[tokio::test]
    async fn test_overall_timeout_emits_timeout_block() {
        let bus = StreamBus::default();
        let options = StreamOptions::new(Duration::from_millis(30), Duration::from_secs(60));
        let stream = stream_events(&bus, "stream:s1", options);

        let blocks: Vec<String> = stream.collect().await;
        let types: Vec<String> = blocks.iter().map(|b| event_type(b)).collect();
        assert_eq!(types, vec!["connected", "timeout"]);
    }

    #[tokio::test]
    async fn test_event_resets_heartbeat_window() {
        let bus = StreamBus::default();
        let options = StreamOptions::new(Duration::from_secs(5), Duration::from_millis(40));
        let stream = stream_events(&bus, "stream:s1", options);
        tokio::pin!(stream);

        assert_eq!(event_type(&stream.next().await.unwrap()), "connected");

        // Keep publishing faster than the heartbeat interval: no heartbeat
        // should slip in between.
        for i in 0..3 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            bus.publish("stream:s1", chunk(&format!("c{}", i)));
            assert_eq!(event_type(&stream.next().await.unwrap()), "chunk");
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_detaches_quietly() {
        let bus = StreamBus::default();
        {
            let stream = stream_events(&bus, "stream:s1", StreamOptions::default());
            tokio::pin!(stream);
            let _ = stream.next().await;
        }
        // Publishing after the subscriber dropped is fire-and-forget.
        assert_eq!(bus.publish("stream:s1", chunk("late")), 0);
    }

    #[test]
    fn test_response_headers() {
        assert!(RESPONSE_HEADERS
            .iter()
            .any(|(k, v)| *k == "Content-Type" && *v == "text/event-stream"));
        assert!(RESPONSE_HEADERS
            .iter()
            .any(|(k, v)| *k == "X-Accel-Buffering" && *v == "no"));
    }
}
