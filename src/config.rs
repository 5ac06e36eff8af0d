//! Relay configuration.
//!
//! Everything tunable lives on [`RelayConfig`]; the defaults match the
//! production values the system was operated with. Only the retry table,
//! the timeouts, the queue sizes, and the TTLs are operationally important.

use crate::retry::RetryPolicy;
use crate::types::QueueName;
use std::collections::BTreeMap;
use std::time::Duration;

/// Tunables for the whole relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Worker pool size per queue. Queues absent from the map are not
    /// started.
    pub queue_workers: BTreeMap<QueueName, usize>,
    /// Per-error-kind retry table.
    pub retry: RetryPolicy,
    /// TTL of persisted partial responses.
    pub partial_ttl: Duration,
    /// Retention of terminal task records in the registry.
    pub result_ttl: Duration,
    /// Soft per-attempt deadline: logged when exceeded, the attempt runs on.
    pub soft_attempt_timeout: Duration,
    /// Hard per-attempt deadline: the attempt is abandoned and the failure
    /// classified as a network-equivalent temporary error.
    pub hard_attempt_timeout: Duration,
    /// Default overall stream-endpoint timeout.
    pub stream_timeout: Duration,
    /// Default stream-endpoint heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Per-subscriber event buffer on bus channels.
    pub bus_capacity: usize,
    /// Budget for draining in-flight tasks on shutdown.
    pub drain_timeout: Duration,
    /// How often queue pumps report liveness.
    pub worker_heartbeat: Duration,
    /// A pump silent for longer than this counts as unhealthy.
    pub worker_stale_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut queue_workers = BTreeMap::new();
        // LLM calls are heavy: strictly one at a time per the llm pool.
        queue_workers.insert(QueueName::Llm, 1);
        queue_workers.insert(QueueName::Feedback, 2);
        queue_workers.insert(QueueName::Analytics, 2);
        queue_workers.insert(QueueName::Quick, 4);
        queue_workers.insert(QueueName::Default, 2);
        Self {
            queue_workers,
            retry: RetryPolicy::default(),
            partial_ttl: Duration::from_secs(3600),
            result_ttl: Duration::from_secs(3600),
            soft_attempt_timeout: Duration::from_secs(120),
            hard_attempt_timeout: Duration::from_secs(180),
            stream_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            bus_capacity: 256,
            drain_timeout: Duration::from_secs(5),
            worker_heartbeat: Duration::from_secs(5),
            worker_stale_after: Duration::from_secs(15),
        }
    }
}

impl RelayConfig {
    /// Set the worker count for one queue.
    pub fn with_queue_workers(mut self, queue: QueueName, workers: usize) -> Self {
        self.queue_workers.insert(queue, workers.max(1));
        self
    }

    /// Replace the retry table.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the partial-response TTL.
    pub fn with_partial_ttl(mut self, ttl: Duration) -> Self {
        self.partial_ttl = ttl;
        self
    }

    /// Set the soft and hard per-attempt deadlines.
    pub fn with_attempt_timeouts(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_attempt_timeout = soft;
        self.hard_attempt_timeout = hard;
        self
    }

    /// Set the stream endpoint defaults.
    pub fn with_stream_defaults(mut self, timeout: Duration, heartbeat: Duration) -> Self {
        self.stream_timeout = timeout;
        self.heartbeat_interval = heartbeat;
        self
    }

    /// Build a config from `RELAY_*` environment variables, falling back to
    /// the defaults for anything unset or unparsable.
    ///
    /// Recognized: `RELAY_PARTIAL_TTL_S`, `RELAY_RESULT_TTL_S`,
    /// `RELAY_SOFT_TIMEOUT_S`, `RELAY_HARD_TIMEOUT_S`,
    /// `RELAY_STREAM_TIMEOUT_S`, `RELAY_HEARTBEAT_S`, `RELAY_BUS_CAPACITY`,
    /// `RELAY_DRAIN_TIMEOUT_S`, and `RELAY_WORKERS_{LLM,FEEDBACK,ANALYTICS,QUICK,DEFAULT}`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("RELAY_PARTIAL_TTL_S") {
            config.partial_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RELAY_RESULT_TTL_S") {
            config.result_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RELAY_SOFT_TIMEOUT_S") {
            config.soft_attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RELAY_HARD_TIMEOUT_S") {
            config.hard_attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RELAY_STREAM_TIMEOUT_S") {
            config.stream_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RELAY_HEARTBEAT_S") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_u64("RELAY_BUS_CAPACITY") {
            config.bus_capacity = capacity as usize;
        }
        if let Some(secs) = env_u64("RELAY_DRAIN_TIMEOUT_S") {
            config.drain_timeout = Duration::from_secs(secs);
        }
        for queue in QueueName::ALL {
            let key = format!("RELAY_WORKERS_{}", queue.as_str().to_uppercase());
            if let Some(workers) = env_u64(&key) {
                config.queue_workers.insert(queue, (workers as usize).max(1));
            }
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_operational_values() {
        let config = RelayConfig::default();
        assert_eq!(config.queue_workers[&QueueName::Llm], 1);
        assert_eq!(config.partial_ttl, Duration::from_secs(3600));
        assert_eq!(config.soft_attempt_timeout, Duration::from_secs(120));
        assert_eq!(config.hard_attempt_timeout, Duration::from_secs(180));
        assert_eq!(config.stream_timeout, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_overrides() {
        let config = RelayConfig::default()
            .with_queue_workers(QueueName::Quick, 8)
            .with_partial_ttl(Duration::from_secs(60))
            .with_attempt_timeouts(Duration::from_secs(10), Duration::from_secs(20));
        assert_eq!(config.queue_workers[&QueueName::Quick], 8);
        assert_eq!(config.partial_ttl, Duration::from_secs(60));
        assert_eq!(config.hard_attempt_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_queue_workers_floor_at_one() {
        let config = RelayConfig::default().with_queue_workers(QueueName::Llm, 0);
        assert_eq!(config.queue_workers[&QueueName::Llm], 1);
    }
}
