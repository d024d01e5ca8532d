//! Quota backoff tracking.
//!
//! A 402/429 answer puts a provider (or one model on it) into backoff for the
//! `Retry-After` period, or the provider's configured default. Calls during
//! backoff fail with `QuotaExceeded` without touching the network.

use std::fmt::Debug;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Where quota backoff applies.
pub trait QuotaPolicy: Send + Sync + Debug {
    /// End of the active backoff covering this call, if any.
    fn blocked_until(&self, provider: &str, model: Option<&str>) -> Option<Instant>;

    fn enter_backoff(&self, provider: &str, model: Option<&str>, window: Duration);

    fn clear(&self, provider: &str);
}

fn active(deadline: Option<Instant>) -> Option<Instant> {
    deadline.filter(|at| Instant::now() < *at)
}

/// Backoff shared by every model on a provider.
#[derive(Debug, Default)]
pub struct ProviderQuotaPolicy {
    until: DashMap<String, Instant>,
}

impl ProviderQuotaPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaPolicy for ProviderQuotaPolicy {
    fn blocked_until(&self, provider: &str, _model: Option<&str>) -> Option<Instant> {
        active(self.until.get(provider).map(|e| *e))
    }

    fn enter_backoff(&self, provider: &str, _model: Option<&str>, window: Duration) {
        let until = Instant::now() + window;
        self.until
            .entry(provider.to_string())
            .and_modify(|e| *e = (*e).max(until))
            .or_insert(until);
    }

    fn clear(&self, provider: &str) {
        self.until.remove(provider);
    }
}

/// Backoff scoped to (provider, model); calls without a model use the
/// provider-wide entry.
#[derive(Debug, Default)]
pub struct ModelQuotaPolicy {
    until: DashMap<(String, Option<String>), Instant>,
}

impl ModelQuotaPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaPolicy for ModelQuotaPolicy {
    fn blocked_until(&self, provider: &str, model: Option<&str>) -> Option<Instant> {
        let scoped = self
            .until
            .get(&(provider.to_string(), model.map(str::to_string)))
            .map(|e| *e);
        let global = self.until.get(&(provider.to_string(), None)).map(|e| *e);
        active(scoped.max(global))
    }

    fn enter_backoff(&self, provider: &str, model: Option<&str>, window: Duration) {
        let until = Instant::now() + window;
        self.until
            .entry((provider.to_string(), model.map(str::to_string)))
            .and_modify(|e| *e = (*e).max(until))
            .or_insert(until);
    }

    fn clear(&self, provider: &str) {
        self.until.retain(|(p, _), _| p != provider);
    }
}
