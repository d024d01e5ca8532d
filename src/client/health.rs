//! Periodic provider liveness checks.
//!
//! Each provider gets its own timer task. Probes go through the dispatcher, so
//! their samples feed the same rolling statistics and circuit breaker as
//! verification traffic, and an open circuit suppresses them like any call.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::transport::CallContext;
use crate::Result;
use crate::types::duration_ms;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Path under the base URL; the model listing endpoint when unset.
    pub path: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            path: None,
        }
    }
}

#[derive(Debug)]
pub struct HealthProber {
    dispatcher: Dispatcher,
    config: HealthConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl HealthProber {
    pub fn new(dispatcher: Dispatcher, config: HealthConfig) -> Self {
        Self {
            dispatcher,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a timer for every registered provider not already probed.
    pub fn start_all(&self) {
        if !self.config.enabled {
            tracing::debug!("Health probing disabled");
            return;
        }
        for name in self.dispatcher.registry().names() {
            self.start(&name);
        }
    }

    pub fn start(&self, provider: &str) {
        if !self.config.enabled {
            return;
        }
        let mut tasks = self.tasks();
        tasks.retain(|(_, handle)| !handle.is_finished());
        if tasks.iter().any(|(name, _)| name == provider) {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let cancel = self.cancel.child_token();
        let name = provider.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if !dispatcher.registry().is_enabled(&name) {
                    continue;
                }
                let ctx = CallContext::new(config.timeout).with_cancel(cancel.child_token());
                match dispatcher.liveness(&name, config.path.as_deref(), &ctx).await {
                    Ok(latency) => tracing::trace!(
                        provider = %name,
                        latency_ms = latency.as_millis() as u64,
                        "Health probe succeeded"
                    ),
                    Err(e) => tracing::debug!(provider = %name, error = %e, "Health probe failed"),
                }
            }
        });
        tasks.push((provider.to_string(), handle));
    }

    /// Run one liveness check now, outside the timer.
    pub async fn probe_once(&self, provider: &str) -> Result<Duration> {
        let ctx = CallContext::new(self.config.timeout).with_cancel(self.cancel.child_token());
        self.dispatcher
            .liveness(provider, self.config.path.as_deref(), &ctx)
            .await
    }

    pub fn running(&self) -> usize {
        self.tasks()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Cancel every timer and any probe in flight.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks().drain(..).collect();
        for (_, handle) in tasks {
            let _ = handle.await;
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::client::transport::{HttpRequest, HttpResponse, Transport};
    use crate::registry::ProviderRegistry;
    use crate::types::{Dialect, ProviderEndpoint};

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Counting {
        async fn send(&self, request: HttpRequest, _ctx: &CallContext) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(request.url);
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    fn dispatcher(transport: Arc<Counting>) -> Dispatcher {
        let registry = ProviderRegistry::default().with_providers([ProviderEndpoint::new(
            "local",
            "http://localhost:8080",
            Dialect::OpenAi,
        )]);
        Dispatcher::new(registry, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_on_interval_until_stopped() {
        let transport = Arc::new(Counting::default());
        let prober = HealthProber::new(
            dispatcher(transport.clone()),
            HealthConfig {
                path: Some("/health".into()),
                ..HealthConfig::default()
            },
        );
        prober.start_all();
        prober.start("local");
        assert_eq!(prober.running(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            transport.urls.lock().unwrap()[0],
            "http://localhost:8080/health"
        );

        prober.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_once_uses_model_listing_by_default() {
        let transport = Arc::new(Counting::default());
        let prober = HealthProber::new(dispatcher(transport.clone()), HealthConfig::default());
        prober.probe_once("local").await.unwrap();
        assert_eq!(
            transport.urls.lock().unwrap()[0],
            "http://localhost:8080/v1/models"
        );
    }

    #[tokio::test]
    async fn test_disabled_config_starts_nothing() {
        let prober = HealthProber::new(
            dispatcher(Arc::new(Counting::default())),
            HealthConfig {
                enabled: false,
                ..HealthConfig::default()
            },
        );
        prober.start_all();
        assert_eq!(prober.running(), 0);
    }
}
