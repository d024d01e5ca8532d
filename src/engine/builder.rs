//! EngineBuilder and store selection.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{Engine, TriggerMode};
use crate::auth::{ChainResolver, CredentialResolver};
use crate::catalog::ModelCatalog;
use crate::client::{Dispatcher, HealthProber, LatencyRouter, QuotaPolicy, ReqwestTransport, Transport};
use crate::config::{EngineSettings, SettingsValidator, StoreSettings};
use crate::events::EventBus;
use crate::observability::MetricsRegistry;
use crate::probes::ProbeSet;
use crate::registry::{DisableReason, ProviderRegistry};
use crate::scheduler::{Schedule, Scheduler};
use crate::store::{MemoryStore, RunStore};
use crate::types::ProviderEndpoint;
use crate::verifier::Orchestrator;
use crate::{Error, Result};

#[derive(Default)]
pub struct EngineBuilder {
    settings: EngineSettings,
    store: Option<Arc<dyn RunStore>>,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn CredentialResolver>>,
    quota: Option<Arc<dyn QuotaPolicy>>,
    probes: Option<ProbeSet>,
    trigger_mode: TriggerMode,
    event_capacity: Option<usize>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all settings. Providers and schedules added earlier are kept.
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        let providers = std::mem::take(&mut self.settings.providers);
        let schedules = std::mem::take(&mut self.settings.schedules);
        self.settings = settings;
        self.settings.providers.extend(providers);
        self.settings.schedules.extend(schedules);
        self
    }

    pub fn provider(mut self, endpoint: ProviderEndpoint) -> Self {
        self.settings.providers.push(endpoint);
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.settings.schedules.push(schedule);
        self
    }

    /// Use this store instead of the one named in settings.
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn quota_policy(mut self, policy: Arc<dyn QuotaPolicy>) -> Self {
        self.quota = Some(policy);
        self
    }

    pub fn probes(mut self, probes: ProbeSet) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = mode;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Validate settings and wire every component. No background task is
    /// started until [`Engine::start`].
    pub async fn build(self) -> Result<Engine> {
        let report = SettingsValidator::new()
            .validate(&self.settings)
            .into_result()?;
        let settings = self.settings;

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(ChainResolver::default()));
        let registry = ProviderRegistry::new(resolver).with_providers(settings.providers.clone());
        for (name, reason) in &report.disabled_providers {
            registry.disable(name, DisableReason::InvalidConfiguration(reason.clone()));
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let store = match self.store {
            Some(store) => store,
            None => open_store(&settings.store).await?,
        };

        let events = self
            .event_capacity
            .map(EventBus::new)
            .unwrap_or_default();
        let metrics = Arc::new(MetricsRegistry::new());
        let mut dispatcher = Dispatcher::new(registry, transport)
            .with_config(settings.dispatch.clone())
            .with_router(LatencyRouter::new(settings.router.clone()))
            .with_events(events.clone())
            .with_metrics(metrics);
        if let Some(policy) = self.quota {
            dispatcher = dispatcher.with_quota_policy(policy);
        }

        let catalog =
            ModelCatalog::new(dispatcher.clone(), settings.catalog.clone()).with_store(store.clone());
        let mut orchestrator = Orchestrator::new(
            dispatcher.clone(),
            catalog,
            store.clone(),
            settings.verifier.clone(),
        );
        if let Some(probes) = self.probes {
            orchestrator = orchestrator.with_probes(probes);
        }

        let scheduler = Scheduler::new(orchestrator.clone(), settings.scheduler.clone());
        for schedule in &settings.schedules {
            scheduler.register(schedule.clone())?;
        }
        let health = HealthProber::new(dispatcher.clone(), settings.health.clone());

        tracing::info!(
            providers = settings.providers.len(),
            schedules = settings.schedules.len(),
            store = store.name(),
            "Verification engine ready"
        );

        Ok(Engine {
            dispatcher,
            orchestrator,
            scheduler,
            health: Arc::new(health),
            store,
            events,
            trigger_mode: self.trigger_mode,
            cancel: CancellationToken::new(),
            settings: Arc::new(std::sync::RwLock::new(settings)),
        })
    }
}

/// Open the store described by `settings`.
pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn RunStore>> {
    match settings {
        StoreSettings::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "jsonl")]
        StoreSettings::Jsonl {
            path,
            sync_on_write,
        } => {
            use crate::store::{JsonlConfig, JsonlStore, SyncMode};

            let mut config = JsonlConfig::builder();
            if let Some(path) = path {
                config = config.base_dir(path);
            }
            if *sync_on_write {
                config = config.sync_mode(SyncMode::OnWrite);
            }
            Ok(Arc::new(JsonlStore::new(config.build()).await?))
        }
        #[cfg(feature = "postgres")]
        StoreSettings::Postgres {
            url,
            table_prefix,
            max_connections,
        } => {
            use crate::store::{PostgresConfig, PostgresStore};

            let config = PostgresConfig::new(url.clone())
                .with_table_prefix(table_prefix.clone())
                .with_max_connections(*max_connections);
            Ok(Arc::new(PostgresStore::connect(&config).await?))
        }
        #[allow(unreachable_patterns)]
        other => Err(Error::Config(format!(
            "store backend {other:?} is not compiled in"
        ))),
    }
}
