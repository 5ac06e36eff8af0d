use std::time::Duration;
use thiserror::Error;

/// Errors produced by the relay and its components.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Provider`](crate::provider::Provider) implementations when
    /// the upstream returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A provider reported a failure that is not a plain HTTP status.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The model name did not resolve to a registered provider.
    ///
    /// Worded so the classifier files it as an invalid request: retrying a
    /// model name that cannot resolve can never succeed.
    #[error("Invalid request: no provider registered for model '{0}'")]
    UnknownModel(String),

    /// A single attempt exceeded the hard per-attempt deadline.
    #[error("Attempt timed out after {0:?} (connection abandoned)")]
    AttemptTimeout(Duration),

    /// The task was cancelled via the control API or shutdown.
    #[error("Task was cancelled")]
    Cancelled,

    /// The target queue is not running (dispatcher shut down or unknown queue).
    #[error("Queue '{0}' is not accepting tasks")]
    QueueClosed(String),

    /// Partial-response store failure. Persist paths treat this as
    /// best-effort and log instead of propagating.
    #[error("Partial store error: {0}")]
    Store(String),

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
