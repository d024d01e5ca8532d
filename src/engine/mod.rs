//! Engine facade.
//!
//! [`Engine`] wires the registry, dispatch layer, catalog, orchestrator,
//! store, scheduler and health prober together and exposes the operations
//! outer collaborators use: trigger a run, read history, read the latest run
//! and subscribe to events.

mod builder;

pub use builder::{EngineBuilder, open_store};

use std::sync::{Arc, RwLock};

use futures::Stream;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{Dispatcher, HealthProber, ProviderSnapshot};
use crate::config::{EngineSettings, SettingsValidator};
use crate::events::{Event, EventKind};
use crate::observability::{MetricsRegistry, MetricsSummary};
use crate::registry::DisableReason;
use crate::scheduler::{JobState, ScheduleError, Scheduler, TargetStatus};
use crate::store::{RunStore, StoreError, StoreResult};
use crate::types::{ModelRecord, VerificationRun};
use crate::verifier::Orchestrator;
use crate::{Error, Result};

/// How [`Engine::trigger_verification`] waits for the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Return once the run is persisted.
    #[default]
    Sync,
    /// Return the run id immediately; completion arrives as an event.
    Async,
}

pub struct Engine {
    dispatcher: Dispatcher,
    orchestrator: Orchestrator,
    scheduler: Scheduler,
    health: Arc<HealthProber>,
    store: Arc<dyn RunStore>,
    events: crate::events::EventBus,
    trigger_mode: TriggerMode,
    cancel: CancellationToken,
    settings: Arc<RwLock<EngineSettings>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("providers", &self.dispatcher.registry().names())
            .field("store", &self.store.name())
            .field("trigger_mode", &self.trigger_mode)
            .finish()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start health probing and the scheduler loop.
    pub fn start(&self) {
        self.health.start_all();
        self.scheduler.start();
    }

    /// Stop background work and cancel runs in flight.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.stop().await;
        self.health.stop().await;
        tracing::info!("Verification engine stopped");
    }

    /// Verify one (provider, model) pair and return its run id.
    ///
    /// Fails with [`ScheduleError::TargetBusy`] while another run of the same
    /// target, scheduled or manual, is in progress.
    pub async fn trigger_verification(&self, provider: &str, model: &str) -> Result<Uuid> {
        match self.trigger_mode {
            TriggerMode::Sync => self.verify(provider, model).await.map(|run| run.run_id),
            TriggerMode::Async => self.spawn_verification(provider, model),
        }
    }

    /// Verify and wait for the persisted run.
    pub async fn verify(&self, provider: &str, model: &str) -> Result<VerificationRun> {
        self.ensure_provider(provider)?;
        let guard = self.claim(provider, model)?;
        let run_id = Uuid::new_v4();
        self.scheduler
            .mark(provider, model, JobState::Running, run_id, None);

        let result = self
            .orchestrator
            .verify_as(run_id, provider, model, self.cancel.child_token())
            .await;
        drop(guard);
        self.record(provider, model, run_id, &result);
        result
    }

    fn spawn_verification(&self, provider: &str, model: &str) -> Result<Uuid> {
        self.ensure_provider(provider)?;
        let guard = self.claim(provider, model)?;
        let run_id = Uuid::new_v4();
        self.scheduler
            .mark(provider, model, JobState::Running, run_id, None);

        let orchestrator = self.orchestrator.clone();
        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.child_token();
        let (provider, model) = (provider.to_string(), model.to_string());
        tokio::spawn(async move {
            let _guard = guard;
            let result = orchestrator
                .verify_as(run_id, &provider, &model, cancel)
                .await;
            if let Err(e) = &result {
                tracing::warn!(%provider, %model, %run_id, error = %e, "Triggered verification failed");
            }
            record_status(&scheduler, &provider, &model, run_id, &result);
        });
        Ok(run_id)
    }

    fn ensure_provider(&self, provider: &str) -> Result<()> {
        self.dispatcher
            .registry()
            .status(provider)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("provider", provider))
    }

    fn claim(&self, provider: &str, model: &str) -> Result<crate::scheduler::RunGuard> {
        self.scheduler.try_claim(provider, model).ok_or_else(|| {
            Error::Schedule(ScheduleError::TargetBusy {
                provider: provider.to_string(),
                model: model.to_string(),
            })
        })
    }

    fn record(&self, provider: &str, model: &str, run_id: Uuid, result: &Result<VerificationRun>) {
        record_status(&self.scheduler, provider, model, run_id, result);
    }

    /// One page of runs, oldest first.
    pub async fn get_history(
        &self,
        provider: &str,
        model: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VerificationRun>> {
        Ok(self
            .store
            .history_page(provider, model, limit, offset)
            .await?)
    }

    /// Every run for the pair, oldest first, fetched lazily.
    pub fn history<'a>(
        &'a self,
        provider: &'a str,
        model: &'a str,
    ) -> BoxStream<'a, StoreResult<VerificationRun>> {
        self.store.history(provider, model)
    }

    pub async fn get_latest(&self, provider: &str, model: &str) -> Result<VerificationRun> {
        self.store
            .latest(provider, model)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { provider, model } => {
                    Error::not_found("verification run", format!("{provider}/{model}"))
                }
                other => Error::Storage(other),
            })
    }

    /// Events of one kind from now on.
    pub fn subscribe(&self, kind: EventKind) -> impl Stream<Item = Event> + Send + 'static {
        self.events.subscribe(kind)
    }

    pub fn subscribe_all(&self) -> impl Stream<Item = Event> + Send + 'static {
        self.events.subscribe_all()
    }

    pub async fn discover_models(&self, provider: &str) -> Result<Vec<ModelRecord>> {
        self.ensure_provider(provider)?;
        Ok(self.orchestrator.catalog().discover_models(provider).await)
    }

    pub async fn model_snapshots(&self, provider: &str, model: &str) -> Result<Vec<ModelRecord>> {
        Ok(self.store.snapshots(provider, model).await?)
    }

    /// Apply new settings to providers and schedules.
    ///
    /// Nothing changes when the settings fail validation. Component tuning
    /// (timeouts, breaker thresholds, router weights) is fixed at build time.
    pub async fn reload(&self, settings: EngineSettings) -> Result<()> {
        let report = SettingsValidator::new().validate(&settings).into_result()?;
        self.scheduler.reload(settings.schedules.clone())?;

        let registry = self.dispatcher.registry();
        registry.reload(settings.providers.clone()).await;
        for (name, reason) in &report.disabled_providers {
            registry.disable(name, DisableReason::InvalidConfiguration(reason.clone()));
        }
        for name in registry.enabled_names() {
            self.orchestrator.catalog().invalidate(&name);
            if !self.cancel.is_cancelled() {
                self.health.start(&name);
            }
        }

        tracing::info!(
            providers = settings.providers.len(),
            schedules = settings.schedules.len(),
            "Settings reloaded"
        );
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self, provider: &str, model: &str) -> Option<TargetStatus> {
        self.scheduler.status(provider, model)
    }

    pub fn provider_snapshot(&self, provider: &str) -> Option<ProviderSnapshot> {
        self.dispatcher.snapshot(provider)
    }

    pub fn metrics(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self.dispatcher.metrics())
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        self.dispatcher.metrics()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }
}

fn record_status(
    scheduler: &Scheduler,
    provider: &str,
    model: &str,
    run_id: Uuid,
    result: &Result<VerificationRun>,
) {
    match result {
        Ok(run) => scheduler.mark(provider, model, JobState::Completed, run.run_id, None),
        Err(e) => scheduler.mark(
            provider,
            model,
            JobState::Failed,
            run_id,
            Some(e.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::client::{CallContext, HttpRequest, HttpResponse, Transport};
    use crate::store::MemoryStore;
    use crate::types::{Dialect, ProviderEndpoint, RunStatus};

    /// Serves a one-model listing and answers every chat call with "4".
    #[derive(Debug)]
    struct Canned {
        delay: Duration,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn send(&self, request: HttpRequest, _ctx: &CallContext) -> Result<HttpResponse> {
            if request.url.ends_with("/models") {
                return Ok(HttpResponse::new(200, r#"{"data":[{"id":"m1"}]}"#));
            }
            tokio::time::sleep(self.delay).await;
            Ok(HttpResponse::new(
                200,
                r#"{"choices":[{"message":{"role":"assistant","content":"4"},"finish_reason":"stop"}]}"#,
            ))
        }
    }

    async fn engine(mode: TriggerMode, delay: Duration) -> Engine {
        Engine::builder()
            .provider(ProviderEndpoint::new("local", "http://localhost:1", Dialect::OpenAi))
            .transport(Arc::new(Canned { delay }))
            .store(Arc::new(MemoryStore::new()))
            .trigger_mode(mode)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_sync_persists() {
        let engine = engine(TriggerMode::Sync, Duration::ZERO).await;
        let run_id = engine.trigger_verification("local", "m1").await.unwrap();

        let latest = engine.get_latest("local", "m1").await.unwrap();
        assert_eq!(latest.run_id, run_id);
        assert_eq!(latest.outcomes.len(), 5);
        assert_eq!(
            engine.status("local", "m1").unwrap().state,
            JobState::Completed
        );
        assert_eq!(engine.get_history("local", "m1", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_and_missing_latest() {
        let engine = engine(TriggerMode::Sync, Duration::ZERO).await;
        assert!(matches!(
            engine.trigger_verification("ghost", "m1").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            engine.get_latest("local", "m1").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_trigger_emits_event_and_guards_target() {
        let engine = engine(TriggerMode::Async, Duration::from_secs(5)).await;
        let mut completed = Box::pin(engine.subscribe(EventKind::RunCompleted));

        let run_id = engine.trigger_verification("local", "m1").await.unwrap();
        assert!(matches!(
            engine.trigger_verification("local", "m1").await,
            Err(Error::Schedule(ScheduleError::TargetBusy { .. }))
        ));

        let event = completed.next().await.unwrap();
        assert_eq!(event.run_id, Some(run_id));
        tokio::task::yield_now().await;
        assert!(!engine.scheduler().is_running("local", "m1"));
        assert_eq!(engine.get_latest("local", "m1").await.unwrap().run_id, run_id);
    }

    #[tokio::test]
    async fn test_reload_disables_removed_and_invalid() {
        let engine = engine(TriggerMode::Sync, Duration::ZERO).await;
        let settings = EngineSettings::default()
            .with_provider(ProviderEndpoint::new("other", "ftp://nowhere", Dialect::OpenAi));
        engine.reload(settings).await.unwrap();

        let registry = engine.dispatcher().registry();
        assert!(!registry.is_enabled("local"));
        assert!(!registry.is_enabled("other"));
        assert_eq!(engine.settings().providers.len(), 1);

        let run = engine.verify("local", "m1").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_reload_rejects_invalid_settings() {
        let engine = engine(TriggerMode::Sync, Duration::ZERO).await;
        let mut settings = EngineSettings::default();
        settings.verifier.fan_out = 0;
        assert!(matches!(engine.reload(settings).await, Err(Error::Config(_))));
        assert!(engine.dispatcher().registry().is_enabled("local"));
    }
}
