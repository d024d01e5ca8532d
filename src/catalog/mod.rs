//! Model catalog.
//!
//! Discovery walks three sources in order: the provider's live listing
//! endpoint, the models named on its configuration entry, then the builtin
//! static catalog. It never fails the caller; a provider that yields nothing
//! produces an empty list and a logged degradation. Results are cached per
//! provider for a TTL and every discovery is appended to the store's snapshot
//! log when a store is attached.

mod builtin;

pub use builtin::{builtin_capabilities, builtin_models};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::client::{CallContext, DiscoveredModel, Dispatcher};
use crate::store::RunStore;
use crate::types::{CatalogSource, ModelCapabilities, ModelRecord, duration_ms};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Age after which cached models are rediscovered.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    #[serde(rename = "discovery_timeout_ms", with = "duration_ms")]
    pub discovery_timeout: Duration,
    pub persist_snapshots: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            discovery_timeout: Duration::from_secs(10),
            persist_snapshots: true,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    models: Vec<ModelRecord>,
    fetched_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    dispatcher: Dispatcher,
    store: Option<Arc<dyn RunStore>>,
    config: CatalogConfig,
    cache: Arc<DashMap<String, CacheEntry>>,
}

impl ModelCatalog {
    pub fn new(dispatcher: Dispatcher, config: CatalogConfig) -> Self {
        Self {
            dispatcher,
            store: None,
            config,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Discover now, bypassing the cache.
    pub async fn discover_models(&self, provider: &str) -> Vec<ModelRecord> {
        let models = self.discover(provider).await;
        self.cache.insert(
            provider.to_string(),
            CacheEntry {
                models: models.clone(),
                fetched_at: Instant::now(),
            },
        );
        self.persist(&models).await;
        models
    }

    /// Cached models, rediscovering when absent or stale.
    pub async fn models(&self, provider: &str) -> Vec<ModelRecord> {
        match self.cached(provider) {
            Some(models) => models,
            None => self.discover_models(provider).await,
        }
    }

    /// Look up one model, rediscovering once if the cache is stale.
    pub async fn find(&self, provider: &str, model: &str) -> Option<ModelRecord> {
        self.models(provider)
            .await
            .into_iter()
            .find(|m| m.model_id == model)
    }

    pub fn is_stale(&self, provider: &str) -> bool {
        self.cache
            .get(provider)
            .is_none_or(|entry| entry.fetched_at.elapsed() >= self.config.ttl)
    }

    pub fn invalidate(&self, provider: &str) {
        self.cache.remove(provider);
    }

    fn cached(&self, provider: &str) -> Option<Vec<ModelRecord>> {
        let entry = self.cache.get(provider)?;
        (entry.fetched_at.elapsed() < self.config.ttl).then(|| entry.models.clone())
    }

    async fn discover(&self, provider: &str) -> Vec<ModelRecord> {
        let endpoint = match self.dispatcher.registry().resolve(provider) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(provider, error = %e, "Model discovery for unknown provider");
                return Vec::new();
            }
        };

        let ctx = CallContext::new(self.config.discovery_timeout);
        match self.dispatcher.list_models(provider, &ctx).await {
            Ok(discovered) if !discovered.is_empty() => {
                tracing::debug!(provider, count = discovered.len(), "Discovered models");
                return discovered
                    .into_iter()
                    .map(|m| live_record(provider, m))
                    .collect();
            }
            Ok(_) => {
                tracing::warn!(provider, "Model discovery returned no models, falling back");
            }
            Err(e) => {
                tracing::warn!(provider, error = %e, "Model discovery failed, falling back");
            }
        }

        self.dispatcher.metrics().catalog_fallbacks.inc();

        if !endpoint.models.is_empty() {
            return endpoint
                .models
                .iter()
                .map(|id| {
                    let record = ModelRecord::new(provider, id.as_str(), CatalogSource::Configured);
                    match builtin_capabilities(provider, id) {
                        Some(caps) => record.with_capabilities(caps),
                        None => record,
                    }
                })
                .collect();
        }

        let models = builtin_models(provider);
        if models.is_empty() {
            tracing::warn!(provider, "No models available from any catalog source");
        }
        models
    }

    async fn persist(&self, models: &[ModelRecord]) {
        let Some(store) = self.store.as_ref().filter(|_| self.config.persist_snapshots) else {
            return;
        };
        for record in models {
            if let Err(e) = store.append_snapshot(record).await {
                tracing::warn!(
                    provider = %record.provider,
                    model = %record.model_id,
                    error = %e,
                    "Failed to append catalog snapshot"
                );
            }
        }
    }
}

fn live_record(provider: &str, discovered: DiscoveredModel) -> ModelRecord {
    let capabilities = builtin_capabilities(provider, &discovered.id)
        .map(|caps| ModelCapabilities {
            context_window: discovered.context_window.or(caps.context_window),
            ..caps
        })
        .unwrap_or(ModelCapabilities {
            context_window: discovered.context_window,
            ..ModelCapabilities::default()
        });
    let mut record = ModelRecord::new(provider, discovered.id, CatalogSource::Live)
        .with_capabilities(capabilities);
    if let Some(name) = discovered.display_name {
        record = record.with_display_name(name);
    }
    record
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::Result;
    use crate::client::{HttpRequest, HttpResponse, Transport};
    use crate::registry::ProviderRegistry;
    use crate::store::MemoryStore;
    use crate::types::{Dialect, ProviderEndpoint};

    #[derive(Debug)]
    struct Listing {
        status: u16,
        body: &'static str,
        calls: AtomicUsize,
    }

    impl Listing {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for Listing {
        async fn send(&self, _request: HttpRequest, _ctx: &CallContext) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(self.status, self.body))
        }
    }

    fn catalog(endpoint: ProviderEndpoint, transport: Arc<Listing>) -> ModelCatalog {
        let registry = ProviderRegistry::default().with_providers([endpoint]);
        ModelCatalog::new(Dispatcher::new(registry, transport), CatalogConfig::default())
    }

    #[tokio::test]
    async fn test_live_discovery() {
        let transport = Listing::new(
            200,
            r#"{"data":[{"id":"gpt-4o","object":"model"},{"id":"custom-ft","object":"model"}]}"#,
        );
        let store = Arc::new(MemoryStore::new());
        let catalog = catalog(
            ProviderEndpoint::new("openai", "http://localhost:1", Dialect::OpenAi),
            transport,
        )
        .with_store(store.clone());

        let models = catalog.discover_models("openai").await;
        assert_eq!(models.len(), 2);
        assert!(models.iter().all(|m| m.source == CatalogSource::Live));
        assert!(models[0].capabilities.tool_calling);
        assert_eq!(store.snapshots("openai", "custom-ft").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_configured_models() {
        let transport = Listing::new(500, "down");
        let catalog = catalog(
            ProviderEndpoint::new("groq", "http://localhost:1", Dialect::OpenAi)
                .with_models(["llama-3.1-8b-instant"]),
            transport,
        );
        let models = catalog.discover_models("groq").await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].source, CatalogSource::Configured);
        assert_eq!(
            catalog.dispatcher.metrics().catalog_fallbacks.get(),
            1
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_builtin_then_empty() {
        let catalog_a = catalog(
            ProviderEndpoint::new("mistral", "http://localhost:1", Dialect::OpenAi),
            Listing::new(200, r#"{"data":[]}"#),
        );
        let models = catalog_a.discover_models("mistral").await;
        assert!(models.iter().any(|m| m.model_id == "mistral-small"));
        assert!(models.iter().all(|m| m.source == CatalogSource::StaticFallback));

        let catalog_b = catalog(
            ProviderEndpoint::new("acme", "http://localhost:1", Dialect::OpenAi),
            Listing::new(503, "unavailable"),
        );
        assert!(catalog_b.discover_models("acme").await.is_empty());
        assert!(catalog_b.discover_models("not-registered").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_uses_cache_until_stale() {
        let transport = Listing::new(200, r#"{"data":[{"id":"gpt-4o"}]}"#);
        let catalog = catalog(
            ProviderEndpoint::new("openai", "http://localhost:1", Dialect::OpenAi),
            transport.clone(),
        );

        assert!(catalog.find("openai", "gpt-4o").await.is_some());
        assert!(catalog.find("openai", "missing").await.is_none());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(!catalog.is_stale("openai"));

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(catalog.is_stale("openai"));
        assert!(catalog.find("openai", "gpt-4o").await.is_some());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
