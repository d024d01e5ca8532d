//! Provider registry.
//!
//! Holds provider configuration keyed by name and resolves credentials at call
//! time. Providers are never removed at runtime; reload and failures only
//! toggle their enabled status.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::auth::{ChainResolver, CredentialResolver};
use crate::types::ProviderEndpoint;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DisableReason {
    /// `enabled: false` in configuration.
    Configuration,
    /// Entry failed validation (unparseable base URL, empty name, ...).
    InvalidConfiguration(String),
    /// Credential reference could not be resolved.
    MissingCredential,
    /// Provider answered 401/403; stays disabled until the credential changes.
    AuthenticationRejected,
    /// Entry absent from the latest configuration reload.
    Removed,
}

impl DisableReason {
    fn is_credential(&self) -> bool {
        matches!(
            self,
            DisableReason::AuthenticationRejected | DisableReason::MissingCredential
        )
    }
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisableReason::Configuration => f.write_str("disabled in configuration"),
            DisableReason::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            DisableReason::MissingCredential => f.write_str("credential could not be resolved"),
            DisableReason::AuthenticationRejected => f.write_str("credential rejected by provider"),
            DisableReason::Removed => f.write_str("removed from configuration"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Enabled,
    Disabled {
        reason: DisableReason,
        since: DateTime<Utc>,
    },
}

impl ProviderStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ProviderStatus::Enabled)
    }
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    endpoint: ProviderEndpoint,
    status: ProviderStatus,
    /// Hash of the last secret handed out for this provider.
    credential_fingerprint: Option<u64>,
}

impl ProviderEntry {
    fn from_endpoint(endpoint: ProviderEndpoint) -> Self {
        let status = match validate_endpoint(&endpoint) {
            Err(msg) => disabled(DisableReason::InvalidConfiguration(msg)),
            Ok(()) if !endpoint.enabled => disabled(DisableReason::Configuration),
            Ok(()) => ProviderStatus::Enabled,
        };
        Self {
            endpoint,
            status,
            credential_fingerprint: None,
        }
    }
}

fn fingerprint(secret: &SecretString) -> u64 {
    let mut hasher = DefaultHasher::new();
    secret.expose_secret().hash(&mut hasher);
    hasher.finish()
}

fn disabled(reason: DisableReason) -> ProviderStatus {
    ProviderStatus::Disabled {
        reason,
        since: Utc::now(),
    }
}

fn validate_endpoint(endpoint: &ProviderEndpoint) -> std::result::Result<(), String> {
    if endpoint.name.trim().is_empty() {
        return Err("provider name is empty".into());
    }
    let url = url::Url::parse(&endpoint.base_url)
        .map_err(|e| format!("base_url '{}': {}", endpoint.base_url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if endpoint.credential_ref.as_deref().is_some_and(|r| r.trim().is_empty()) {
        return Err("credential_ref is empty".into());
    }
    Ok(())
}

/// Provider-keyed configuration table with fail-closed credential resolution.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    entries: Arc<DashMap<String, ProviderEntry>>,
    resolver: Arc<dyn CredentialResolver>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(Arc::new(ChainResolver::default()))
    }
}

impl ProviderRegistry {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            resolver,
        }
    }

    pub fn with_providers(self, endpoints: impl IntoIterator<Item = ProviderEndpoint>) -> Self {
        for endpoint in endpoints {
            self.register(endpoint);
        }
        self
    }

    /// Insert or replace one provider. Invalid entries are stored disabled.
    pub fn register(&self, endpoint: ProviderEndpoint) {
        let entry = ProviderEntry::from_endpoint(endpoint);
        if let ProviderStatus::Disabled { reason, .. } = &entry.status {
            tracing::warn!(provider = %entry.endpoint.name, %reason, "Provider registered disabled");
        }
        self.entries.insert(entry.endpoint.name.clone(), entry);
    }

    pub fn resolve(&self, name: &str) -> Result<ProviderEndpoint> {
        self.entries
            .get(name)
            .map(|e| e.endpoint.clone())
            .ok_or_else(|| Error::not_found("provider", name))
    }

    /// Endpoint of an enabled provider, or `ProviderDisabled`.
    pub fn resolve_enabled(&self, name: &str) -> Result<ProviderEndpoint> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::not_found("provider", name))?;
        match &entry.status {
            ProviderStatus::Enabled => Ok(entry.endpoint.clone()),
            ProviderStatus::Disabled { reason, .. } => Err(Error::ProviderDisabled {
                provider: name.to_string(),
                reason: reason.to_string(),
            }),
        }
    }

    /// Secret for the provider's credential reference.
    ///
    /// `Ok(None)` for providers that need no credential. An unresolvable
    /// reference disables the provider.
    pub async fn credential(&self, name: &str) -> Result<Option<SecretString>> {
        let endpoint = self.resolve_enabled(name)?;
        let Some(reference) = endpoint.credential_ref.as_deref() else {
            return Ok(None);
        };

        match self.resolver.resolve(reference).await {
            Ok(secret) => {
                if let Some(mut entry) = self.entries.get_mut(name) {
                    entry.credential_fingerprint = Some(fingerprint(&secret));
                }
                Ok(Some(secret))
            }
            Err(e) => {
                tracing::warn!(provider = name, error = %e, "Credential resolution failed");
                self.disable(name, DisableReason::MissingCredential);
                Err(Error::ProviderDisabled {
                    provider: name.to_string(),
                    reason: DisableReason::MissingCredential.to_string(),
                })
            }
        }
    }

    pub fn disable(&self, name: &str, reason: DisableReason) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            if let ProviderStatus::Disabled { reason: current, .. } = &entry.status
                && *current == reason
            {
                return;
            }
            tracing::warn!(provider = name, %reason, "Provider disabled");
            entry.status = disabled(reason);
        }
    }

    /// Re-enable a provider whose configuration is valid and enabled.
    pub fn enable(&self, name: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(name) else {
            return false;
        };
        if validate_endpoint(&entry.endpoint).is_err() || !entry.endpoint.enabled {
            return false;
        }
        if !entry.status.is_enabled() {
            tracing::info!(provider = name, "Provider re-enabled");
            entry.status = ProviderStatus::Enabled;
        }
        true
    }

    pub fn status(&self, name: &str) -> Option<ProviderStatus> {
        self.entries.get(name).map(|e| e.status.clone())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| e.status.is_enabled())
    }

    /// Apply a new provider list.
    ///
    /// Credential disables are re-checked against the resolver when the
    /// credential reference is unchanged: a missing credential that now
    /// resolves re-enables the provider, and a rejected one re-enables only
    /// once the resolver yields a different secret. Providers missing from the
    /// list are disabled, not removed.
    pub async fn reload(&self, endpoints: Vec<ProviderEndpoint>) {
        let incoming: std::collections::HashSet<String> =
            endpoints.iter().map(|e| e.name.clone()).collect();

        for endpoint in endpoints {
            let mut entry = ProviderEntry::from_endpoint(endpoint);
            let previous = self
                .entries
                .get(&entry.endpoint.name)
                .map(|e| e.value().clone())
                .filter(|p| p.endpoint.credential_ref == entry.endpoint.credential_ref);

            if let Some(previous) = previous {
                entry.credential_fingerprint = previous.credential_fingerprint;
                if let ProviderStatus::Disabled { reason, since } = previous.status
                    && reason.is_credential()
                    && entry.status.is_enabled()
                {
                    if self.credential_recovered(&entry, &reason).await {
                        tracing::info!(provider = %entry.endpoint.name, %reason, "Credential recovered on reload");
                    } else {
                        entry.status = ProviderStatus::Disabled { reason, since };
                    }
                }
            }
            self.entries.insert(entry.endpoint.name.clone(), entry);
        }

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !incoming.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for name in stale {
            self.disable(&name, DisableReason::Removed);
        }
    }

    async fn credential_recovered(&self, entry: &ProviderEntry, reason: &DisableReason) -> bool {
        let Some(reference) = entry.endpoint.credential_ref.as_deref() else {
            return true;
        };
        match self.resolver.resolve(reference).await {
            Ok(secret) => {
                *reason != DisableReason::AuthenticationRejected
                    || entry.credential_fingerprint != Some(fingerprint(&secret))
            }
            Err(e) => {
                tracing::debug!(provider = %entry.endpoint.name, error = %e, "Credential still unresolvable");
                false
            }
        }
    }

    /// All provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.status.is_enabled())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn endpoints(&self) -> Vec<ProviderEndpoint> {
        let mut endpoints: Vec<ProviderEndpoint> =
            self.entries.iter().map(|e| e.endpoint.clone()).collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
