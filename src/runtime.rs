//! Runtime context shared across the relay.
//!
//! [`RelayCtx`] carries the bus, the partial store, the provider registry,
//! the task registry, the worker health map, and the config. It is
//! constructed once at process start and threaded through the dispatcher and
//! workers; nothing in the crate reaches for process-global state.

use crate::bus::StreamBus;
use crate::config::RelayConfig;
use crate::dispatcher::WorkerHealthMap;
use crate::provider::{Provider, ProviderRegistry};
use crate::store::{MemoryPartialStore, PartialStore};
use crate::task::TaskRegistry;
use std::sync::Arc;

/// Shared runtime context.
///
/// # Example
///
/// ```
/// use llm_relay::{RelayCtx, provider::MockProvider};
/// use std::sync::Arc;
///
/// let ctx = RelayCtx::builder()
///     .provider("mock", Arc::new(MockProvider::streaming(vec!["hi".into()])))
///     .build();
/// ```
pub struct RelayCtx {
    /// The full tunable set.
    pub config: RelayConfig,
    /// Pub/sub fan-out from workers to stream endpoints.
    pub bus: StreamBus,
    /// Partial-response persistence.
    pub store: Arc<dyn PartialStore>,
    /// LLM backends, keyed by model-name prefix.
    pub providers: ProviderRegistry,
    /// Live task handles for the control API.
    pub registry: TaskRegistry,
    /// Queue-pump liveness, for the health endpoint.
    pub workers: WorkerHealthMap,
}

impl RelayCtx {
    /// Start building a context.
    pub fn builder() -> RelayCtxBuilder {
        RelayCtxBuilder {
            config: None,
            providers: ProviderRegistry::new(),
            store: None,
        }
    }
}

impl std::fmt::Debug for RelayCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCtx")
            .field("providers", &self.providers.len())
            .field("channels", &self.bus.channel_count())
            .field("tasks", &self.registry.len())
            .finish()
    }
}

/// Builder for [`RelayCtx`].
pub struct RelayCtxBuilder {
    config: Option<RelayConfig>,
    providers: ProviderRegistry,
    store: Option<Arc<dyn PartialStore>>,
}

impl RelayCtxBuilder {
    /// Use this config instead of the defaults.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a provider under a model-name prefix.
    pub fn provider(mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.register(prefix, provider);
        self
    }

    /// Replace the whole provider registry.
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Use a custom partial store. Default: [`MemoryPartialStore`] with the
    /// configured TTL.
    pub fn store(mut self, store: Arc<dyn PartialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the shared context.
    pub fn build(self) -> Arc<RelayCtx> {
        let config = self.config.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryPartialStore::new(config.partial_ttl)));
        Arc::new(RelayCtx {
            bus: StreamBus::new(config.bus_capacity),
            store,
            providers: self.providers,
            registry: TaskRegistry::new(config.result_ttl),
            workers: WorkerHealthMap::new(config.worker_stale_after),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[test]
    fn test_builder_defaults() {
        let ctx = RelayCtx::builder().build();
        assert!(ctx.providers.is_empty());
        assert_eq!(ctx.bus.channel_count(), 0);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_builder_registers_providers() {
        let ctx = RelayCtx::builder()
            .provider("mock", Arc::new(MockProvider::streaming(vec!["x".into()])))
            .build();
        assert_eq!(ctx.providers.len(), 1);
        assert!(ctx.providers.resolve("mock/m").is_ok());
    }
}
