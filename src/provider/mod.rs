//! Provider trait and registry.
//!
//! A provider is the narrow seam between the relay and an LLM backend: it
//! accepts a prompt bundle and pushes content chunks through a callback as
//! they arrive. The worker owns everything else (indexing, events, retry).
//!
//! ## Architecture
//!
//! ```text
//! Worker ──► ProviderRegistry::resolve("gemini/gemini-1.5-flash")
//!                   │
//!            ┌──────┴───────┐
//!       OpenAiCompatProvider  MockProvider
//!       /v1/chat/completions  scripted outcomes
//!       SSE streaming         (tests)
//! ```

pub mod mock;
pub mod openai;
pub mod sse;

pub use mock::{MockOutcome, MockProvider};
pub use openai::OpenAiCompatProvider;

use crate::error::{RelayError, Result};
use crate::types::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Abstraction over LLM backends.
///
/// Implementors stream a chat completion for the given model and prompt
/// bundle, invoking `on_chunk` for each unit of content as it arrives. The
/// trait is object-safe and used as `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Stream a chat completion. `on_chunk` is called once per content chunk,
    /// in arrival order. Returns once the provider's stream is exhausted.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<()>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Registry of providers keyed by model-name prefix.
///
/// Model names are provider-qualified: `"gemini/gemini-1.5-flash"` resolves
/// the `"gemini"` entry and hands it the bare model id. Names without a
/// prefix fall back to the default prefix (`"gemini"` unless overridden).
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_prefix: String,
}

impl ProviderRegistry {
    /// An empty registry with the stock `"gemini"` default prefix.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_prefix: "gemini".to_string(),
        }
    }

    /// Register a provider under a prefix.
    pub fn register(&mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(prefix.into(), provider);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_provider(mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(prefix, provider);
        self
    }

    /// Change the prefix assumed for unqualified model names.
    pub fn with_default_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.default_prefix = prefix.into();
        self
    }

    /// Resolve a provider-qualified model name into the provider and the
    /// bare model id it should be called with.
    pub fn resolve(&self, model_name: &str) -> Result<(Arc<dyn Provider>, String)> {
        let (prefix, model_id) = match model_name.split_once('/') {
            Some((prefix, model_id)) => (prefix, model_id),
            None => (self.default_prefix.as_str(), model_name),
        };
        match self.providers.get(prefix) {
            Some(provider) => Ok((provider.clone(), model_id.to_string())),
            None => Err(RelayError::UnknownModel(model_name.to_string())),
        }
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no providers are registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_qualified_name() {
        let registry = ProviderRegistry::new()
            .with_provider("mock", Arc::new(MockProvider::streaming(vec!["hi".into()])));
        let (provider, model_id) = registry.resolve("mock/some-model").unwrap();
        assert_eq!(provider.name(), "mock");
        assert_eq!(model_id, "some-model");
    }

    #[test]
    fn test_resolve_unqualified_uses_default_prefix() {
        let registry = ProviderRegistry::new()
            .with_default_prefix("mock")
            .with_provider("mock", Arc::new(MockProvider::streaming(vec!["hi".into()])));
        let (_, model_id) = registry.resolve("bare-model").unwrap();
        assert_eq!(model_id, "bare-model");
    }

    #[test]
    fn test_resolve_unknown_prefix_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.resolve("acme/x1").unwrap_err();
        assert!(matches!(err, RelayError::UnknownModel(_)));
    }

    #[test]
    fn test_model_id_keeps_further_slashes() {
        let registry = ProviderRegistry::new()
            .with_provider("mock", Arc::new(MockProvider::streaming(vec!["x".into()])));
        let (_, model_id) = registry.resolve("mock/org/model").unwrap();
        assert_eq!(model_id, "org/model");
    }
}
