//! Resilient dispatch of provider calls.
//!
//! Every outbound call passes, in order: the registry's enabled check, the
//! quota policy, the provider's circuit breaker, and its admission semaphore.
//! Only then is a credential resolved and a request sent, under a deadline
//! derived from the caller's context.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::adapter::{DialectAdapter, adapter_for};
use super::error::classify_status;
use super::messages::{ChatRequest, ChatResponse, DiscoveredModel};
use super::quota::{ProviderQuotaPolicy, QuotaPolicy};
use super::resilience::{
    Admission, CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, ExponentialBackoff,
    RollingStats, StatsSnapshot,
};
use super::router::{Candidate, LatencyRouter};
use super::transport::{CallContext, HttpRequest, HttpResponse, Transport};
use crate::events::EventBus;
use crate::observability::MetricsRegistry;
use crate::registry::{DisableReason, ProviderRegistry};
use crate::types::{ProviderEndpoint, duration_ms};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-attempt timeout, further narrowed by the caller's deadline.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    pub max_transient_retries: u32,
    pub retry_backoff: ExponentialBackoff,
    pub circuit: CircuitConfig,
    pub stats_capacity: usize,
    #[serde(rename = "stats_max_age_ms", with = "duration_ms")]
    pub stats_max_age: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_transient_retries: 2,
            retry_backoff: ExponentialBackoff::default(),
            circuit: CircuitConfig::default(),
            stats_capacity: 100,
            stats_max_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct ProviderState {
    breaker: CircuitBreaker,
    stats: Mutex<RollingStats>,
    admission: Arc<Semaphore>,
}

impl ProviderState {
    fn stats(&self) -> std::sync::MutexGuard<'_, RollingStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Diagnostics for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub provider: String,
    pub enabled: bool,
    pub circuit: CircuitSnapshot,
    pub stats: StatsSnapshot,
    pub available_permits: usize,
    pub quota_blocked: bool,
}

/// Shared dispatch layer. Cheap to clone; clones share all provider state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ProviderRegistry,
    transport: Arc<dyn Transport>,
    states: Arc<DashMap<String, Arc<ProviderState>>>,
    quota: Arc<dyn QuotaPolicy>,
    router: LatencyRouter,
    config: Arc<DispatchConfig>,
    events: EventBus,
    metrics: Arc<MetricsRegistry>,
}

impl Dispatcher {
    pub fn new(registry: ProviderRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            states: Arc::new(DashMap::new()),
            quota: Arc::new(ProviderQuotaPolicy::new()),
            router: LatencyRouter::default(),
            config: Arc::new(DispatchConfig::default()),
            events: EventBus::default(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_quota_policy(mut self, policy: Arc<dyn QuotaPolicy>) -> Self {
        self.quota = policy;
        self
    }

    pub fn with_router(mut self, router: LatencyRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// One chat call to `provider`.
    pub async fn call(
        &self,
        provider: &str,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse> {
        let (response, _) = self
            .execute(
                provider,
                Some(&request.model),
                ctx,
                |adapter, endpoint, secret| adapter.chat_request(endpoint, secret, request),
                |adapter, response| adapter.parse_chat(provider, request, response),
            )
            .await?;
        Ok(response)
    }

    pub async fn list_models(
        &self,
        provider: &str,
        ctx: &CallContext,
    ) -> Result<Vec<DiscoveredModel>> {
        let (models, _) = self
            .execute(
                provider,
                None,
                ctx,
                |adapter, endpoint, secret| Ok(adapter.models_request(endpoint, secret)),
                |adapter, response| adapter.parse_models(provider, response),
            )
            .await?;
        Ok(models)
    }

    /// Lightweight reachability call; returns the observed latency.
    pub async fn liveness(
        &self,
        provider: &str,
        path: Option<&str>,
        ctx: &CallContext,
    ) -> Result<Duration> {
        let ((), latency) = self
            .execute(
                provider,
                None,
                ctx,
                |adapter, endpoint, secret| Ok(adapter.liveness_request(endpoint, secret, path)),
                |_, _| Ok(()),
            )
            .await?;
        Ok(latency)
    }

    /// Route across `candidates` serving `request.model`, falling through to
    /// the next-best provider when one fails at the provider level.
    ///
    /// Returns the provider that answered together with its response.
    pub async fn call_routed(
        &self,
        candidates: &[String],
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<(String, ChatResponse)> {
        let ranked = self.rank(candidates, Some(&request.model));
        if ranked.is_empty() {
            return Err(Error::not_found("route", request.model.clone()));
        }

        let mut last_error = None;
        for provider in ranked {
            match self.call(&provider, request, ctx).await {
                Ok(response) => return Ok((provider, response)),
                Err(e) if e.is_provider_level() || e.counts_toward_circuit() => {
                    tracing::warn!(
                        provider = %provider,
                        model = %request.model,
                        error = %e,
                        "Routed call failed, trying next provider"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::not_found("route", request.model.clone())))
    }

    /// Eligible providers among `candidates`, best first.
    pub fn rank(&self, candidates: &[String], model: Option<&str>) -> Vec<String> {
        let inputs: Vec<Candidate> = candidates
            .iter()
            .map(|name| self.candidate(name, model))
            .collect();
        self.router.rank(&inputs)
    }

    fn candidate(&self, name: &str, model: Option<&str>) -> Candidate {
        let Ok(endpoint) = self.registry.resolve_enabled(name) else {
            return Candidate::new(name).unavailable();
        };
        let state = self.state(&endpoint);
        let stats = state.stats();
        Candidate {
            name: name.to_string(),
            p50: stats.p50(),
            error_rate: stats.error_rate(),
            cost_weight: endpoint.cost_weight,
            available: self.quota.blocked_until(name, model).is_none()
                && state.breaker.is_rejecting().is_none(),
        }
    }

    pub fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.states.get(provider).map(|s| s.breaker.state())
    }

    pub fn snapshot(&self, provider: &str) -> Option<ProviderSnapshot> {
        let endpoint = self.registry.resolve(provider).ok()?;
        let state = self.state(&endpoint);
        let stats = state.stats().snapshot();
        Some(ProviderSnapshot {
            provider: provider.to_string(),
            enabled: self.registry.is_enabled(provider),
            circuit: state.breaker.snapshot(),
            stats,
            available_permits: state.admission.available_permits(),
            quota_blocked: self.quota.blocked_until(provider, None).is_some(),
        })
    }

    /// Clear circuit, quota and latency state for a provider.
    pub fn reset(&self, provider: &str) {
        if let Some(state) = self.states.get(provider) {
            state.breaker.reset();
            state.stats().clear();
        }
        self.quota.clear(provider);
    }

    fn state(&self, endpoint: &ProviderEndpoint) -> Arc<ProviderState> {
        self.states
            .entry(endpoint.name.clone())
            .or_insert_with(|| {
                Arc::new(ProviderState {
                    breaker: CircuitBreaker::new(&endpoint.name, self.config.circuit.clone())
                        .with_events(self.events.clone()),
                    stats: Mutex::new(RollingStats::new(
                        self.config.stats_capacity,
                        self.config.stats_max_age,
                    )),
                    admission: Arc::new(Semaphore::new(endpoint.rate_limit.max_in_flight.max(1))),
                })
            })
            .value()
            .clone()
    }

    fn circuit_open(&self, provider: &str, retry_at: chrono::DateTime<Utc>) -> Error {
        self.metrics.circuit_rejections.inc();
        tracing::debug!(provider, %retry_at, "Call rejected by open circuit");
        Error::CircuitOpen {
            provider: provider.to_string(),
            retry_at,
        }
    }

    async fn execute<T, B, P>(
        &self,
        provider: &str,
        model: Option<&str>,
        ctx: &CallContext,
        build: B,
        parse: P,
    ) -> Result<(T, Duration)>
    where
        B: Fn(&dyn DialectAdapter, &ProviderEndpoint, Option<&SecretString>) -> Result<HttpRequest>,
        P: Fn(&dyn DialectAdapter, &HttpResponse) -> Result<T>,
    {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let endpoint = self.registry.resolve_enabled(provider).inspect_err(|e| {
            if matches!(e, Error::ProviderDisabled { .. }) {
                self.metrics.disabled_rejections.inc();
            }
        })?;

        if let Some(until) = self.quota.blocked_until(provider, model) {
            self.metrics.quota_rejections.inc();
            return Err(Error::QuotaExceeded {
                provider: provider.to_string(),
                retry_after: Some(until.saturating_duration_since(Instant::now())),
            });
        }

        let state = self.state(&endpoint);
        if let Some(retry_at) = state.breaker.is_rejecting() {
            return Err(self.circuit_open(provider, retry_at));
        }

        let admission_sem = Arc::clone(&state.admission);
        let _permit = ctx
            .run(async move { admission_sem.acquire_owned().await.map_err(|_| Error::Cancelled) })
            .await?;

        let admission = state
            .breaker
            .try_acquire()
            .map_err(|retry_at| self.circuit_open(provider, retry_at))?;

        let secret = match self.registry.credential(provider).await {
            Ok(secret) => secret,
            Err(e) => {
                state.breaker.release(admission);
                return Err(e);
            }
        };

        let adapter = adapter_for(endpoint.dialect);
        let request = match build(adapter.as_ref(), &endpoint, secret.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                state.breaker.release(admission);
                return Err(e);
            }
        };

        // The half-open trial gets exactly one network attempt.
        let max_retries = match admission {
            Admission::Trial => 0,
            Admission::Normal => self.config.max_transient_retries,
        };
        let mut attempt = 0u32;

        loop {
            let attempt_ctx = ctx.child(self.config.call_timeout);
            self.metrics.record_dispatch_start();
            let started = Instant::now();
            let result = self
                .transport
                .send(request.clone(), &attempt_ctx)
                .await
                .and_then(|response| {
                    if response.is_success() {
                        Ok(response)
                    } else {
                        Err(classify_status(provider, &response))
                    }
                });
            let latency = started.elapsed();
            self.metrics
                .record_dispatch_end(result.is_ok(), latency.as_secs_f64() * 1000.0);

            let err = match result {
                Ok(response) => {
                    state.stats().record(latency, true);
                    state.breaker.record_success(admission);
                    return parse(adapter.as_ref(), &response).map(|value| (value, latency));
                }
                Err(err) => err,
            };

            if err.counts_toward_circuit() {
                state.stats().record(latency, false);
                attempt += 1;
                if attempt <= max_retries
                    && let Some(delay) = self
                        .config
                        .retry_backoff
                        .delay_within(attempt, ctx.remaining())
                {
                    self.metrics.dispatch_retries.inc();
                    tracing::debug!(
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying transient failure"
                    );
                    match ctx.sleep(delay).await {
                        Ok(()) => continue,
                        Err(interrupted) => {
                            state.breaker.record_failure(admission);
                            return Err(interrupted);
                        }
                    }
                }
                if state.breaker.record_failure(admission) {
                    tracing::warn!(provider, error = %err, "Circuit opened");
                }
                return Err(err);
            }

            match &err {
                Error::AuthenticationInvalid { status, .. } => {
                    tracing::warn!(provider, status, "Credential rejected, disabling provider");
                    self.registry
                        .disable(provider, DisableReason::AuthenticationRejected);
                }
                Error::QuotaExceeded { retry_after, .. } => {
                    let window = retry_after.unwrap_or(Duration::from_secs(
                        endpoint.rate_limit.quota_backoff_secs,
                    ));
                    tracing::warn!(
                        provider,
                        model,
                        backoff_secs = window.as_secs(),
                        "Quota exceeded, entering backoff"
                    );
                    self.quota.enter_backoff(provider, model, window);
                }
                _ => {}
            }
            state.breaker.release(admission);
            return Err(err);
        }
    }
}
