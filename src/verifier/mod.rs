//! Capability verification orchestrator.
//!
//! [`Orchestrator::verify`] runs the probe battery against one
//! (provider, model) pair, scores the outcomes and persists the run exactly
//! once. Probes run concurrently up to the configured fan-out and every probe
//! yields exactly one outcome, whatever happens to the provider.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::catalog::ModelCatalog;
use crate::client::{CallContext, Dispatcher};
use crate::events::Event;
use crate::probes::{CapabilityProbe, ProbeContext, ProbeSet};
use crate::registry::ProviderStatus;
use crate::scoring::{CORE_PROBES, ScoringPolicy};
use crate::store::{RunStore, SaveOutcome, with_retry};
use crate::types::{ModelRecord, ProbeOutcome, RunStatus, VerificationRun, duration_ms};
use crate::{Error, ErrorClass, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Default per-probe deadline; a probe may declare its own.
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Probes of one run executing at the same time.
    pub fan_out: usize,
    pub min_passed: usize,
    pub persistence_retries: u32,
    #[serde(rename = "persistence_backoff_ms", with = "duration_ms")]
    pub persistence_backoff: Duration,
    /// Add the streaming, JSON mode and reasoning probes to the battery.
    pub extended: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            fan_out: 4,
            min_passed: 3,
            persistence_retries: 3,
            persistence_backoff: Duration::from_millis(200),
            extended: false,
        }
    }
}

/// First provider-level failure seen in a run; later probes are skipped with it.
type RootCause = Arc<Mutex<Option<(ErrorClass, String)>>>;

#[derive(Debug, Clone)]
pub struct Orchestrator {
    dispatcher: Dispatcher,
    catalog: ModelCatalog,
    store: Arc<dyn RunStore>,
    probes: ProbeSet,
    scoring: ScoringPolicy,
    config: VerifierConfig,
}

impl Orchestrator {
    pub fn new(
        dispatcher: Dispatcher,
        catalog: ModelCatalog,
        store: Arc<dyn RunStore>,
        config: VerifierConfig,
    ) -> Self {
        let probes = if config.extended {
            ProbeSet::extended()
        } else {
            ProbeSet::core()
        };
        let scoring = ScoringPolicy::new(config.min_passed, CORE_PROBES);
        Self {
            dispatcher,
            catalog,
            store,
            probes,
            scoring,
            config,
        }
    }

    pub fn with_probes(mut self, probes: ProbeSet) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringPolicy) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn probes(&self) -> &ProbeSet {
        &self.probes
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn verify(&self, provider: &str, model: &str) -> Result<VerificationRun> {
        self.verify_with_cancel(provider, model, CancellationToken::new())
            .await
    }

    /// Verify under an external cancellation token; cancelling yields an
    /// [`RunStatus::Aborted`] run carrying every outcome gathered so far.
    pub async fn verify_with_cancel(
        &self,
        provider: &str,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<VerificationRun> {
        self.verify_as(Uuid::new_v4(), provider, model, cancel).await
    }

    /// Run the battery under a caller-chosen run id.
    pub(crate) async fn verify_as(
        &self,
        run_id: Uuid,
        provider: &str,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<VerificationRun> {
        let span = tracing::info_span!("verify", %provider, %model, %run_id);
        self.verify_inner(run_id, provider, model, cancel)
            .instrument(span)
            .await
    }

    async fn verify_inner(
        &self,
        run_id: Uuid,
        provider: &str,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<VerificationRun> {
        let endpoint_status = self
            .dispatcher
            .registry()
            .status(provider)
            .ok_or_else(|| Error::not_found("provider", provider))?;

        let metrics = self.dispatcher.metrics().clone();
        metrics.active_runs.inc();
        let attempt_at = VerificationRun::attempt_timestamp();
        let started = Instant::now();

        let (outcomes, status) = match endpoint_status {
            ProviderStatus::Disabled { reason, .. } => {
                let evidence = format!("provider disabled: {reason}");
                (self.skip_all(ErrorClass::ProviderDisabled, &evidence), RunStatus::Failed)
            }
            ProviderStatus::Enabled => self.check_and_run(provider, model, &cancel).await,
        };

        let (score, supported) = self.scoring.score(&outcomes);
        let run = VerificationRun {
            run_id,
            provider: provider.to_string(),
            model: model.to_string(),
            attempt_at,
            outcomes,
            score,
            supported,
            duration: VerificationRun::normalized_duration(started.elapsed()),
            status,
        };

        let saved = self.persist(&run).await;
        metrics.active_runs.dec();

        match saved {
            Ok(()) => {
                metrics.record_run(run.status);
                info!(
                    status = %run.status,
                    score = run.score,
                    supported = run.supported,
                    passed = run.passed_count(),
                    duration_ms = run.duration.as_millis() as u64,
                    "Verification run completed"
                );
                self.dispatcher.events().publish(Event::run_completed(
                    provider, model, run_id, run.status, run.score,
                ));
                Ok(run)
            }
            Err(e) => {
                metrics.record_run(RunStatus::Failed);
                tracing::error!(error = %e, "Verification run could not be persisted");
                self.dispatcher.events().publish(Event::run_completed(
                    provider,
                    model,
                    run_id,
                    RunStatus::Failed,
                    run.score,
                ));
                Err(e)
            }
        }
    }

    async fn check_and_run(
        &self,
        provider: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> (Vec<ProbeOutcome>, RunStatus) {
        let was_cached = !self.catalog.is_stale(provider);
        let mut known = self.catalog.models(provider).await;
        if was_cached && !known.is_empty() && !serves(&known, model) {
            debug!("Model missing from cached catalog, rediscovering");
            known = self.catalog.discover_models(provider).await;
        }
        if !known.is_empty() && !serves(&known, model) {
            warn!("Model not in catalog");
            let evidence = format!("model {model} is not served by {provider}");
            return (self.skip_all(ErrorClass::NotFound, &evidence), RunStatus::Failed);
        }
        if known.is_empty() {
            debug!("Catalog empty for provider, verifying unconfirmed model");
        }

        let root_cause: RootCause = Arc::new(Mutex::new(None));
        let fan_out = self.config.fan_out.max(1);

        let runs: Vec<BoxFuture<'_, (usize, ProbeOutcome)>> = self
            .probes
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, probe)| {
                let root_cause = root_cause.clone();
                async move {
                    let outcome = self
                        .run_probe(probe, provider, model, cancel, &root_cause)
                        .await;
                    (index, outcome)
                }
                .boxed()
            })
            .collect();
        let mut indexed: Vec<(usize, ProbeOutcome)> = futures::stream::iter(runs)
            .buffer_unordered(fan_out)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<ProbeOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

        let status = if cancel.is_cancelled() {
            RunStatus::Aborted
        } else if root_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
            || unreachable(&outcomes)
        {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        (outcomes, status)
    }

    async fn run_probe(
        &self,
        probe: Arc<dyn CapabilityProbe>,
        provider: &str,
        model: &str,
        cancel: &CancellationToken,
        root_cause: &RootCause,
    ) -> ProbeOutcome {
        let name = probe.name().to_string();
        if cancel.is_cancelled() {
            return ProbeOutcome::skipped(name, ErrorClass::Cancelled, "run cancelled before probe started");
        }
        if let Some((class, cause)) = root_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return ProbeOutcome::skipped(name, class, format!("skipped: {cause}"));
        }

        let timeout = probe.timeout().unwrap_or(self.config.probe_timeout);
        let ctx = ProbeContext {
            dispatcher: self.dispatcher.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            call: CallContext::new(timeout).with_cancel(cancel.child_token()),
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, probe.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };
        let latency = started.elapsed();
        self.dispatcher
            .metrics()
            .probe_latency_ms
            .observe(latency.as_secs_f64() * 1000.0);

        match result {
            Ok(verdict) => {
                debug!(probe = %name, passed = verdict.passed, score = verdict.score, "Probe evaluated");
                ProbeOutcome::evaluated(name, verdict.passed, verdict.score, latency, verdict.evidence)
            }
            Err(e) => {
                let class = if cancel.is_cancelled() {
                    ErrorClass::Cancelled
                } else {
                    e.class()
                };
                if class.is_provider_level() {
                    let mut cause = root_cause.lock().unwrap_or_else(|e| e.into_inner());
                    if cause.is_none() {
                        warn!(probe = %name, error = %e, "Provider-level failure, skipping remaining probes");
                        *cause = Some((class, e.to_string()));
                    }
                } else {
                    debug!(probe = %name, error = %e, class = %class, "Probe failed");
                }
                ProbeOutcome::failed(name, class, latency, e.to_string())
            }
        }
    }

    fn skip_all(&self, class: ErrorClass, evidence: &str) -> Vec<ProbeOutcome> {
        self.probes
            .iter()
            .map(|p| ProbeOutcome::skipped(p.name(), class, evidence))
            .collect()
    }

    async fn persist(&self, run: &VerificationRun) -> Result<()> {
        let attempts = AtomicU32::new(0);
        let store = &self.store;
        let attempts_ref = &attempts;
        let outcome = with_retry(
            self.config.persistence_retries,
            self.config.persistence_backoff,
            self.config.persistence_backoff * 16,
            move || async move {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                store.save(run).await
            },
        )
        .await;

        let retries = attempts.load(Ordering::SeqCst).saturating_sub(1);
        if retries > 0 {
            self.dispatcher
                .metrics()
                .persistence_retries
                .add(u64::from(retries));
        }

        match outcome? {
            SaveOutcome::Inserted => Ok(()),
            SaveOutcome::AlreadyStored => {
                debug!("Run key already stored; save treated as success");
                Ok(())
            }
        }
    }
}

fn serves(known: &[ModelRecord], model: &str) -> bool {
    known.iter().any(|m| m.model_id == model)
}

/// Every outcome failed for lack of a usable connection.
fn unreachable(outcomes: &[ProbeOutcome]) -> bool {
    !outcomes.is_empty()
        && outcomes.iter().all(|o| {
            matches!(
                o.classification,
                Some(ErrorClass::NetworkTransient | ErrorClass::Timeout | ErrorClass::CircuitOpen)
            )
        })
}
