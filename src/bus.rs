//! Stream bus: named-channel pub/sub fan-out from workers to stream endpoints.
//!
//! Channels are created on first use by either side, so a subscriber that
//! attaches right after dispatch sees the `start` event even though the
//! worker has not published yet. The bus is not a log: a late subscriber does
//! not see past events.
//!
//! Delivery is at-least-once within a single subscription, in publish order.
//! A subscriber that falls behind the channel buffer skips forward to the
//! oldest retained event (logged, never fatal).
//!
//! A channel is removed once a stream-ending event passes through it
//! (`complete`, `error`, `cancelled`); subscribers drain what is buffered and
//! then see end-of-stream.

use crate::event::StreamEvent;
use futures::Stream;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// The primary channel name for a session.
pub fn stream_channel(session_id: &str) -> String {
    format!("stream:{}", session_id)
}

/// Named-channel pub/sub fabric.
///
/// Cheap to share: hold it in an `Arc` (the runtime context does).
pub struct StreamBus {
    channels: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
    capacity: usize,
}

impl StreamBus {
    /// Create a bus whose channels buffer up to `capacity` events per
    /// subscriber before lagging.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to a channel. Returns the number of subscribers that
    /// received it (0 when nobody is attached — publishing is fire-and-forget).
    pub fn publish(&self, channel: &str, event: StreamEvent) -> usize {
        let ends = event.ends_stream();
        let sender = {
            let mut channels = self.channels.lock().expect("bus lock poisoned");
            let sender = channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .clone();
            if ends {
                channels.remove(channel);
            }
            sender
        };
        let delivered = sender.send(event).unwrap_or(0);
        if ends {
            debug!(channel = %channel, "stream channel closed");
        }
        delivered
    }

    /// Attach a subscriber to a channel, creating the channel if needed.
    pub fn subscribe(&self, channel: &str) -> EventSubscription {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        EventSubscription {
            channel: channel.to_string(),
            rx: sender.subscribe(),
        }
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("bus lock poisoned").len()
    }
}

impl Default for StreamBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One subscriber's view of a channel.
pub struct EventSubscription {
    channel: String,
    rx: broadcast::Receiver<StreamEvent>,
}

impl EventSubscription {
    /// Receive the next event, or `None` once the channel is closed and
    /// drained. Lagged gaps are skipped with a warning.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        skipped = skipped,
                        "subscriber lagged, skipping to oldest retained event"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt the subscription into a `Stream` of events (lag gaps skipped).
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        BroadcastStream::new(self.rx).filter_map(|item| item.ok())
    }
}
