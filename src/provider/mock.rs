//! Mock provider for testing without a live LLM.
//!
//! [`MockProvider`] plays back a script of per-call outcomes, allowing
//! deterministic tests of the full worker loop: clean streams, mid-stream
//! failures with specific statuses, and stalls that only a deadline or a
//! cancel can end.

use super::Provider;
use crate::error::{RelayError, Result};
use crate::types::Message;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What one call to the mock should do.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Emit these chunks, then finish cleanly.
    Stream(Vec<String>),
    /// Emit these chunks, then fail.
    FailAfter {
        /// Chunks emitted before the failure (may be empty).
        chunks: Vec<String>,
        /// When set, fail with this HTTP status.
        status: Option<u16>,
        /// Error text (the HTTP body when `status` is set).
        message: String,
        /// `Retry-After` hint attached to HTTP failures.
        retry_after: Option<Duration>,
    },
    /// Emit these chunks, then never return. Only a deadline or cancel ends
    /// the attempt.
    Stall(Vec<String>),
}

impl MockOutcome {
    /// A failure with an error message and no HTTP status.
    pub fn error(message: impl Into<String>) -> Self {
        MockOutcome::FailAfter {
            chunks: Vec::new(),
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A failure with an HTTP status.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        MockOutcome::FailAfter {
            chunks: Vec::new(),
            status: Some(status),
            message: body.into(),
            retry_after: None,
        }
    }
}

/// A test provider that plays scripted outcomes in order, cycling back to the
/// beginning when the script is exhausted.
#[derive(Debug)]
pub struct MockProvider {
    script: Vec<MockOutcome>,
    index: AtomicUsize,
}

impl MockProvider {
    /// Create a mock with the given script.
    pub fn new(script: Vec<MockOutcome>) -> Self {
        assert!(!script.is_empty(), "MockProvider requires at least one outcome");
        Self {
            script,
            index: AtomicUsize::new(0),
        }
    }

    /// A mock that always streams the same chunks successfully.
    pub fn streaming(chunks: Vec<String>) -> Self {
        Self::new(vec![MockOutcome::Stream(chunks)])
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> MockOutcome {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.script.len();
        self.script[idx].clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream_chat(
        &self,
        _model: &str,
        _messages: &[Message],
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<()> {
        match self.next_outcome() {
            MockOutcome::Stream(chunks) => {
                for chunk in chunks {
                    on_chunk(chunk);
                    // Yield between chunks so cancellation can interleave,
                    // like a real network stream.
                    tokio::task::yield_now().await;
                }
                Ok(())
            }
            MockOutcome::FailAfter {
                chunks,
                status,
                message,
                retry_after,
            } => {
                for chunk in chunks {
                    on_chunk(chunk);
                    tokio::task::yield_now().await;
                }
                match status {
                    Some(status) => Err(RelayError::Http {
                        status,
                        body: message,
                        retry_after,
                    }),
                    None => Err(RelayError::Provider(message)),
                }
            }
            MockOutcome::Stall(chunks) => {
                for chunk in chunks {
                    on_chunk(chunk);
                    tokio::task::yield_now().await;
                }
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_streaming_emits_all_chunks() {
        let mock = MockProvider::streaming(vec!["Hi".into(), " there".into(), "!".into()]);
        let mut chunks = Vec::new();
        mock.stream_chat("m", &[], &mut |c| chunks.push(c))
            .await
            .unwrap();
        assert_eq!(chunks, vec!["Hi", " there", "!"]);
    }

    #[tokio::test]
    async fn test_script_cycles() {
        let mock = MockProvider::new(vec![
            MockOutcome::Stream(vec!["first".into()]),
            MockOutcome::error("boom"),
        ]);
        let mut sink = |_c: String| {};

        assert!(mock.stream_chat("m", &[], &mut sink).await.is_ok());
        assert!(mock.stream_chat("m", &[], &mut sink).await.is_err());
        assert!(mock.stream_chat("m", &[], &mut sink).await.is_ok());
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_fail_after_emits_then_errors() {
        let mock = MockProvider::new(vec![MockOutcome::FailAfter {
            chunks: vec!["par".into(), "tial".into()],
            status: None,
            message: "connection reset by peer".into(),
            retry_after: None,
        }]);
        let mut chunks = Vec::new();
        let err = mock
            .stream_chat("m", &[], &mut |c| chunks.push(c))
            .await
            .unwrap_err();
        assert_eq!(chunks, vec!["par", "tial"]);
        assert!(matches!(err, RelayError::Provider(_)));
    }

    #[tokio::test]
    async fn test_http_outcome_carries_status() {
        let mock = MockProvider::new(vec![MockOutcome::http(401, "bad key")]);
        let err = mock.stream_chat("m", &[], &mut |_| {}).await.unwrap_err();
        match err {
            RelayError::Http { status, .. } => assert_eq!(status, 401),
            other => panic!("expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stall_never_returns() {
        let mock = MockProvider::new(vec![MockOutcome::Stall(vec!["x".into()])]);
        let mut chunks = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            mock.stream_chat("m", &[], &mut |c| chunks.push(c)),
        )
        .await;
        assert!(result.is_err(), "stall must outlive the timeout");
        assert_eq!(chunks, vec!["x"]);
    }
}
