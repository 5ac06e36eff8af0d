//! Retry policy: per-error-kind backoff configuration and the retry decision.
//!
//! The policy is a static table keyed by [`ErrorKind`]. The classifier names
//! the failure; the policy decides whether to retry and how long to wait.
//! Delays grow exponentially, are capped, and get ±10% jitter so simultaneous
//! retries spread out across a fleet. Jitter randomness is per-decision, not
//! per-task.

use crate::classify::{ClassifiedError, ErrorKind};
use std::collections::HashMap;
use std::time::Duration;

/// Backoff configuration for one error kind.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (attempts beyond the first).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay. Prevents exponential blowup on sustained
    /// outages.
    pub max_delay: Duration,
    /// Multiplier applied per attempt: `base * factor^attempt`.
    pub backoff_factor: f64,
    /// Apply ±10% jitter to the computed delay.
    pub jitter: bool,
}

impl RetryConfig {
    /// Build a config from second-granularity values.
    pub fn new(max_retries: u32, base_s: u64, max_s: u64, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(base_s),
            max_delay: Duration::from_secs(max_s),
            backoff_factor,
            jitter: true,
        }
    }

    /// Disable jitter (deterministic delays, mainly for tests).
    pub fn no_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// The per-kind retry table plus a default for unlisted temporary kinds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    configs: HashMap<ErrorKind, RetryConfig>,
    default: RetryConfig,
}

impl Default for RetryPolicy {
    /// The stock table:
    ///
    /// | kind | retries | base | max | factor |
    /// |---|---|---|---|---|
    /// | RateLimit | 5 | 60s | 600s | 1.5 |
    /// | Network | 4 | 1s | 30s | 2.0 |
    /// | ServiceUnavailable | 3 | 30s | 300s | 2.0 |
    /// | other temporary | 3 | 2s | 300s | 2.0 |
    fn default() -> Self {
        let mut configs = HashMap::new();
        configs.insert(ErrorKind::RateLimit, RetryConfig::new(5, 60, 600, 1.5));
        configs.insert(ErrorKind::Network, RetryConfig::new(4, 1, 30, 2.0));
        configs.insert(
            ErrorKind::ServiceUnavailable,
            RetryConfig::new(3, 30, 300, 2.0),
        );
        Self {
            configs,
            default: RetryConfig::new(3, 2, 300, 2.0),
        }
    }
}

impl RetryPolicy {
    /// Override or add the config for one kind.
    pub fn with_config(mut self, kind: ErrorKind, config: RetryConfig) -> Self {
        self.configs.insert(kind, config);
        self
    }

    /// Override the default config used for unlisted temporary kinds.
    pub fn with_default(mut self, config: RetryConfig) -> Self {
        self.default = config;
        self
    }

    /// The config that applies to an error kind.
    pub fn config_for(&self, kind: ErrorKind) -> &RetryConfig {
        self.configs.get(&kind).unwrap_or(&self.default)
    }

    /// Decide whether a failed attempt should be retried.
    ///
    /// `attempt` is 0-based: the number of attempts already completed beyond
    /// the first is `attempt`, so the check is `attempt >= max_retries`.
    /// Returns the decision and a reason string surfaced in events.
    pub fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> (bool, String) {
        if err.is_permanent() {
            return (false, format!("permanent:{}", err.kind));
        }
        let config = self.config_for(err.kind);
        if attempt >= config.max_retries {
            return (false, "max_retries_exceeded".to_string());
        }
        (true, "retrying".to_string())
    }

    /// Delay before the retry that follows failed attempt N (0-indexed).
    ///
    /// `min(max_delay, base * factor^attempt)`, where `base` is the error's
    /// `retry_after` hint when the classifier extracted one, otherwise the
    /// configured base. Jitter is uniform in ±10% and the jittered delay is
    /// floored at one second.
    pub fn delay_for_attempt(&self, err: &ClassifiedError, attempt: u32) -> Duration {
        let config = self.config_for(err.kind);
        let base = err
            .retry_after
            .map(|d| d.as_secs_f64())
            .unwrap_or_else(|| config.base_delay.as_secs_f64());

        let mut delay = base * config.backoff_factor.powi(attempt as i32);
        delay = delay.min(config.max_delay.as_secs_f64());

        if config.jitter {
            let jitter_range = delay * 0.1;
            let jitter = fastrand::f64() * 2.0 * jitter_range - jitter_range;
            delay = (delay + jitter).max(1.0);
        }

        Duration::from_secs_f64(delay)
    }
}
