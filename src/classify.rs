//! Provider error classification.
//!
//! [`classify`] maps any [`RelayError`] coming out of a provider onto a closed
//! taxonomy of [`ErrorKind`]s. Classification is deliberately dumb and total:
//! it never decides whether to retry, it only names the failure. The retry
//! policy ([`RetryPolicy`](crate::retry::RetryPolicy)) owns the decision.
//!
//! Order of classification:
//! 1. HTTP status code, when the error carries one (429, 503, 401/403, 413, 400).
//! 2. An ordered pattern table over the error message. First match wins.
//! 3. Known transport failures (request errors, attempt timeouts) as `Network`.
//! 4. `Unknown`, treated as temporary (fail-soft default).

use crate::error::RelayError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed taxonomy of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// API rate limit hit (HTTP 429, throttling messages).
    RateLimit,
    /// Connection failures, timeouts, resets, DNS errors.
    Network,
    /// Upstream temporarily down (HTTP 503, maintenance).
    ServiceUnavailable,
    /// Bad or missing credentials (HTTP 401/403).
    Authentication,
    /// Billing or usage quota exhausted.
    Quota,
    /// Malformed request (HTTP 400, validation failures).
    InvalidRequest,
    /// Prompt exceeds the model's context window (HTTP 413).
    ContextLength,
    /// Output blocked by the provider's safety filter.
    ContentFilter,
    /// Anything else. Treated as temporary.
    Unknown,
}

impl ErrorKind {
    /// Whether retrying under the same inputs can never succeed.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::Authentication
                | ErrorKind::Quota
                | ErrorKind::InvalidRequest
                | ErrorKind::ContextLength
                | ErrorKind::ContentFilter
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RateLimit => "RateLimit",
            ErrorKind::Network => "Network",
            ErrorKind::ServiceUnavailable => "ServiceUnavailable",
            ErrorKind::Authentication => "Authentication",
            ErrorKind::Quota => "Quota",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ContextLength => "ContextLength",
            ErrorKind::ContentFilter => "ContentFilter",
            ErrorKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A provider error after classification.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    /// The assigned taxonomy entry.
    pub kind: ErrorKind,
    /// Provider-suggested wait before retrying (from `Retry-After` on 429).
    pub retry_after: Option<Duration>,
    /// The original error message, for events and logs.
    pub message: String,
}

impl ClassifiedError {
    /// Whether retrying under the same inputs can never succeed.
    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Ordered message-pattern table. First match wins, so rate-limit phrasing
/// shadows the quota patterns below it (matching the upstream APIs, which
/// report soft quota hits as throttling).
static MESSAGE_PATTERNS: Lazy<Vec<(Regex, ErrorKind)>> = Lazy::new(|| {
    let table: &[(&str, ErrorKind)] = &[
        (
            r"rate.{0,10}limit|quota.{0,10}exceed|too.{0,10}many.{0,10}request",
            ErrorKind::RateLimit,
        ),
        (r"requests per (minute|hour|day)|throttl", ErrorKind::RateLimit),
        (
            r"connection.{0,10}(error|failed|timeout|refused)|network.{0,10}error",
            ErrorKind::Network,
        ),
        (r"timeout|timed.{0,5}out|unreachable|dns.{0,10}error", ErrorKind::Network),
        (r"socket.{0,10}error|connection.{0,10}reset", ErrorKind::Network),
        (
            r"service.{0,10}unavailable|server.{0,10}error|internal.{0,10}error",
            ErrorKind::ServiceUnavailable,
        ),
        (
            r"temporarily.{0,10}unavailable|maintenance",
            ErrorKind::ServiceUnavailable,
        ),
        (
            r"unauthorized|authentication.{0,10}failed|invalid.{0,10}(api.{0,5})?key",
            ErrorKind::Authentication,
        ),
        (
            r"permission.{0,10}denied|access.{0,10}denied",
            ErrorKind::Authentication,
        ),
        (r"usage.{0,10}limit|billing", ErrorKind::Quota),
        (
            r"context.{0,10}(length|size)|token.{0,10}limit|input.{0,10}too.{0,10}long",
            ErrorKind::ContextLength,
        ),
        (
            r"maximum.{0,10}(context|token)|exceeds.{0,10}limit",
            ErrorKind::ContextLength,
        ),
        (
            r"content.{0,10}filter|safety.{0,10}(policy|violation)|inappropriate",
            ErrorKind::ContentFilter,
        ),
        (
            r"blocked.{0,10}content|filtered.{0,10}response",
            ErrorKind::ContentFilter,
        ),
        (
            r"invalid.{0,10}(request|parameter|input)|bad.{0,10}request",
            ErrorKind::InvalidRequest,
        ),
        (r"malformed|validation.{0,10}error", ErrorKind::InvalidRequest),
    ];
    table
        .iter()
        .map(|(pattern, kind)| {
            let re = Regex::new(pattern).expect("classification pattern must compile");
            (re, *kind)
        })
        .collect()
});

/// Classify a provider or transport error. Total: every error maps to exactly
/// one [`ErrorKind`], with `Unknown` as the backstop.
pub fn classify(err: &RelayError) -> ClassifiedError {
    let message = err.to_string();

    // 1. HTTP status, when present.
    if let RelayError::Http {
        status, retry_after, ..
    } = err
    {
        let kind = match status {
            429 => Some(ErrorKind::RateLimit),
            503 => Some(ErrorKind::ServiceUnavailable),
            401 | 403 => Some(ErrorKind::Authentication),
            413 => Some(ErrorKind::ContextLength),
            400 => Some(ErrorKind::InvalidRequest),
            _ => None,
        };
        if let Some(kind) = kind {
            let retry_after = if kind == ErrorKind::RateLimit {
                *retry_after
            } else {
                None
            };
            return ClassifiedError {
                kind,
                retry_after,
                message,
            };
        }
        // Other statuses fall through to the message scan (the body text often
        // names the real failure, e.g. "internal error" on a 500).
    }

    // 2. Message patterns, in table order.
    let lower = message.to_lowercase();
    for (re, kind) in MESSAGE_PATTERNS.iter() {
        if re.is_match(&lower) {
            return ClassifiedError {
                kind: *kind,
                retry_after: None,
                message,
            };
        }
    }

    // 3. Known transport failure types.
    if matches!(
        err,
        RelayError::Request(_) | RelayError::AttemptTimeout(_)
    ) {
        return ClassifiedError {
            kind: ErrorKind::Network,
            retry_after: None,
            message,
        };
    }

    // 4. Fail-soft default: unknown, temporary.
    ClassifiedError {
        kind: ErrorKind::Unknown,
        retry_after: None,
        message,
    }
}
