//! Resilience, scoring, persistence and scheduling through the public API.
//!
//! Run: cargo nextest run --test verification_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use llm_verifier::client::{
    CallContext, ChatRequest, ChatResponse, HttpRequest, HttpResponse, Transport,
};
use llm_verifier::probes::Verdict;
use llm_verifier::store::SaveOutcome;
use llm_verifier::{
    CircuitState, Dialect, DispatchConfig, Dispatcher, Engine, Error, ErrorClass, JsonlConfig,
    JsonlStore, MemoryStore, ProbeContext, ProbeOutcome, ProbeSet, ProviderEndpoint,
    ProviderRegistry, RunStatus, RunStore, Schedule, TargetSelector, VerificationRun,
};
use llm_verifier::{Cadence, CapabilityProbe, ExplicitResolver, score};
use uuid::Uuid;

const MODELS: &str = r#"{"data":[{"id":"m1"}]}"#;
const ANSWER: &str =
    r#"{"choices":[{"message":{"role":"assistant","content":"4"},"finish_reason":"stop"}]}"#;

/// Counts chat calls; fails them with 503 while `failing` is set.
#[derive(Debug)]
struct Flaky {
    failing: AtomicBool,
    delay: Duration,
    chat_calls: AtomicUsize,
}

impl Flaky {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(true),
            delay,
            chat_calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Flaky {
    async fn send(
        &self,
        request: HttpRequest,
        _ctx: &CallContext,
    ) -> llm_verifier::Result<HttpResponse> {
        if request.url.ends_with("/models") {
            return Ok(HttpResponse::new(200, MODELS));
        }
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.failing.load(Ordering::SeqCst) {
            Ok(HttpResponse::new(503, "upstream unavailable"))
        } else {
            Ok(HttpResponse::new(200, ANSWER))
        }
    }
}

/// Serves the listing and answers chat calls after a per-host delay.
#[derive(Debug)]
struct ByHost;

#[async_trait]
impl Transport for ByHost {
    async fn send(
        &self,
        request: HttpRequest,
        _ctx: &CallContext,
    ) -> llm_verifier::Result<HttpResponse> {
        if request.url.ends_with("/models") {
            return Ok(HttpResponse::new(200, MODELS));
        }
        let delay = if request.url.contains("fast.local") {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(500)
        };
        tokio::time::sleep(delay).await;
        Ok(HttpResponse::new(200, ANSWER))
    }
}

/// Never answers within any reasonable deadline.
#[derive(Debug)]
struct Stalled {
    hold: Duration,
    timeout: Duration,
}

#[async_trait]
impl CapabilityProbe for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn request(&self, model: &str) -> ChatRequest {
        ChatRequest::user(model, "wait")
    }

    fn evaluate(&self, _response: &ChatResponse) -> Verdict {
        Verdict::pass(1.0, "answered")
    }

    async fn run(&self, _ctx: &ProbeContext) -> llm_verifier::Result<Verdict> {
        tokio::time::sleep(self.hold).await;
        Ok(Verdict::pass(1.0, "answered"))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn no_retries() -> DispatchConfig {
    DispatchConfig {
        max_transient_retries: 0,
        ..DispatchConfig::default()
    }
}

fn local_dispatcher(transport: Arc<dyn Transport>) -> Dispatcher {
    let registry = ProviderRegistry::new(Arc::new(ExplicitResolver::new())).with_providers([
        ProviderEndpoint::new("local", "http://local.test", Dialect::OpenAi),
    ]);
    Dispatcher::new(registry, transport).with_config(no_retries())
}

mod circuit {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_network() {
        let transport = Flaky::new(Duration::from_millis(10));
        let dispatcher = local_dispatcher(transport.clone());
        let request = ChatRequest::user("m1", "ping");
        let ctx = CallContext::new(Duration::from_secs(5));

        for _ in 0..5 {
            assert!(dispatcher.call("local", &request, &ctx).await.is_err());
        }
        assert_eq!(dispatcher.circuit_state("local"), Some(CircuitState::Open));

        let err = dispatcher.call("local", &request, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(err.class(), ErrorClass::CircuitOpen);
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let transport = Flaky::new(Duration::from_secs(1));
        let dispatcher = local_dispatcher(transport.clone());
        let request = ChatRequest::user("m1", "ping");

        for _ in 0..5 {
            let ctx = CallContext::new(Duration::from_secs(5));
            assert!(dispatcher.call("local", &request, &ctx).await.is_err());
        }
        assert_eq!(dispatcher.circuit_state("local"), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_secs(31)).await;
        transport.failing.store(false, Ordering::SeqCst);

        let ctx = CallContext::new(Duration::from_secs(5));
        let results = futures::future::join_all(
            (0..3).map(|_| dispatcher.call("local", &request, &ctx)),
        )
        .await;

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(Error::CircuitOpen { .. })))
            .count();
        assert_eq!((ok, rejected), (1, 2));
        assert_eq!(transport.calls(), 6);
        assert_eq!(dispatcher.circuit_state("local"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_longer_timeout() {
        let transport = Flaky::new(Duration::from_millis(10));
        let dispatcher = local_dispatcher(transport.clone());
        let request = ChatRequest::user("m1", "ping");

        for _ in 0..5 {
            let ctx = CallContext::new(Duration::from_secs(5));
            let _ = dispatcher.call("local", &request, &ctx).await;
        }
        tokio::time::sleep(Duration::from_secs(31)).await;

        let ctx = CallContext::new(Duration::from_secs(5));
        assert!(dispatcher.call("local", &request, &ctx).await.is_err());
        let snapshot = dispatcher.snapshot("local").unwrap();
        assert_eq!(snapshot.circuit.state, CircuitState::Open);
        assert_eq!(snapshot.circuit.reopen_count, 1);

        // Second recovery window is doubled.
        tokio::time::sleep(Duration::from_secs(31)).await;
        let ctx = CallContext::new(Duration::from_secs(5));
        assert!(matches!(
            dispatcher.call("local", &request, &ctx).await,
            Err(Error::CircuitOpen { .. })
        ));
    }
}

mod routing {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_prefers_lower_latency_provider() {
        let registry = ProviderRegistry::new(Arc::new(ExplicitResolver::new())).with_providers([
            ProviderEndpoint::new("fast", "http://fast.local", Dialect::OpenAi),
            ProviderEndpoint::new("slow", "http://slow.local", Dialect::OpenAi),
        ]);
        let dispatcher = Dispatcher::new(registry, Arc::new(ByHost));
        let request = ChatRequest::user("m1", "ping");
        let ctx = CallContext::new(Duration::from_secs(5));

        for provider in ["slow", "fast", "slow", "fast"] {
            dispatcher.call(provider, &request, &ctx).await.unwrap();
        }

        let candidates = vec!["slow".to_string(), "fast".to_string()];
        assert_eq!(dispatcher.rank(&candidates, Some("m1")), vec!["fast", "slow"]);

        let (chosen, response) = dispatcher
            .call_routed(&candidates, &request, &ctx)
            .await
            .unwrap();
        assert_eq!(chosen, "fast");
        assert_eq!(response.text, "4");
    }
}

mod orchestration {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_recorded_and_run_persists() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::builder()
            .provider(ProviderEndpoint::new("local", "http://local.test", Dialect::OpenAi))
            .transport(Arc::new(ByHost))
            .store(store.clone())
            .probes(ProbeSet::core().with(Arc::new(Stalled {
                hold: Duration::from_secs(120),
                timeout: Duration::from_secs(2),
            })))
            .build()
            .await
            .unwrap();

        let run = engine.verify("local", "m1").await.unwrap();
        let stalled = run.outcome("stalled").unwrap();
        assert!(!stalled.passed);
        assert_eq!(stalled.classification, Some(ErrorClass::Timeout));
        assert_eq!(run.outcomes.len(), 6);
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(store.count().await, 1);
    }

    #[test]
    fn test_score_counts_failures_as_zero() {
        let pass = |name: &str, s: f64| {
            ProbeOutcome::evaluated(name, true, s, Duration::from_millis(100), "ok")
        };
        let fail = |name: &str| {
            ProbeOutcome::failed(name, ErrorClass::Timeout, Duration::from_secs(30), "timeout")
        };
        let outcomes = vec![
            pass("protocol_compliance", 1.0),
            pass("tool_invocation", 0.8),
            fail("context_retention"),
            pass("code_generation", 0.9),
            fail("error_diagnosis"),
        ];

        let (overall, supported) = score(&outcomes);
        assert!((overall - 0.54).abs() < 1e-9);
        assert!(supported);

        let (overall, supported) = score(&outcomes[..2]);
        assert!((overall - 0.36).abs() < 1e-9);
        assert!(!supported);
    }
}

mod persistence {
    use super::*;

    fn run_at(secs: i64) -> VerificationRun {
        VerificationRun {
            run_id: Uuid::new_v4(),
            provider: "local".into(),
            model: "m1".into(),
            attempt_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            outcomes: vec![ProbeOutcome::evaluated(
                "protocol_compliance",
                true,
                1.0,
                Duration::from_millis(80),
                "pong",
            )],
            score: 0.2,
            supported: false,
            duration: Duration::from_millis(900),
            status: RunStatus::Succeeded,
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_key() {
        let store = MemoryStore::new();
        let run = run_at(0);
        assert_eq!(store.save(&run).await.unwrap(), SaveOutcome::Inserted);

        let retry = VerificationRun {
            run_id: Uuid::new_v4(),
            ..run.clone()
        };
        assert_eq!(store.save(&retry).await.unwrap(), SaveOutcome::AlreadyStored);
        assert_eq!(store.latest("local", "m1").await.unwrap().run_id, run.run_id);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_jsonl_history_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = || JsonlConfig::builder().base_dir(dir.path()).build();
        let store = Arc::new(JsonlStore::new(config()).await.unwrap());
        for secs in [30, 10, 20] {
            store.save(&run_at(secs)).await.unwrap();
        }

        let engine = Engine::builder()
            .provider(ProviderEndpoint::new("local", "http://local.test", Dialect::OpenAi))
            .transport(Arc::new(ByHost))
            .store(store)
            .build()
            .await
            .unwrap();

        let page = engine.get_history("local", "m1", 2, 0).await.unwrap();
        let times: Vec<_> = page.iter().map(|r| r.attempt_at.timestamp()).collect();
        assert_eq!(times, vec![1_700_000_010, 1_700_000_020]);

        let run_id = engine.trigger_verification("local", "m1").await.unwrap();
        let streamed: Vec<_> = engine
            .history("local", "m1")
            .map(|r| r.unwrap().run_id)
            .collect()
            .await;
        assert_eq!(streamed.len(), 4);
        assert_eq!(streamed.last(), Some(&run_id));

        // A fresh store over the same directory sees the same latest run.
        let reopened = JsonlStore::new(config()).await.unwrap();
        assert_eq!(reopened.latest("local", "m1").await.unwrap().run_id, run_id);
        assert!(matches!(
            engine.get_latest("local", "unknown").await,
            Err(Error::NotFound { .. })
        ));
    }
}

mod scheduling {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_engine_skips_overlapping_fire() {
        init_tracing();
        let engine = Engine::builder()
            .provider(ProviderEndpoint::new("local", "http://local.test", Dialect::OpenAi))
            .transport(Arc::new(ByHost))
            .store(Arc::new(MemoryStore::new()))
            .probes(ProbeSet::empty().with(Arc::new(Stalled {
                hold: Duration::from_secs(90),
                timeout: Duration::from_secs(200),
            })))
            .schedule(Schedule::new(
                "minutely",
                Cadence::every(Duration::from_secs(60)),
                TargetSelector::target("local", "m1"),
            ))
            .build()
            .await
            .unwrap();
        engine.start();

        // Fires at 60s and runs until 150s; the 120s fire is skipped.
        tokio::time::sleep(Duration::from_secs(125)).await;
        let metrics = engine.metrics_registry().clone();
        assert_eq!(metrics.schedule_fires.get(), 1);
        assert_eq!(metrics.schedule_skips.get(), 1);
        assert!(matches!(
            engine.trigger_verification("local", "m1").await,
            Err(Error::Schedule(_))
        ));

        tokio::time::sleep(Duration::from_secs(175)).await;
        assert_eq!(metrics.schedule_fires.get(), 2);
        assert_eq!(engine.get_history("local", "m1", 10, 0).await.unwrap().len(), 2);

        engine.shutdown().await;
    }
}
