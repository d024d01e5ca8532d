//! # llm-verifier
//!
//! Resilient verification engine for LLM provider endpoints.
//!
//! The engine probes each (provider, model) pair with a fixed battery of
//! capability checks, scores the outcomes deterministically, and keeps an
//! append-only history of runs. Every outbound call goes through a dispatch
//! layer with per-provider circuit breakers, admission limits, health probing
//! and latency-aware routing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_verifier::{Dialect, Engine, ProviderEndpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), llm_verifier::Error> {
//!     let engine = Engine::builder()
//!         .provider(
//!             ProviderEndpoint::new("openai", "https://api.openai.com", Dialect::OpenAi)
//!                 .with_credential_ref("OPENAI_API_KEY"),
//!         )
//!         .build()
//!         .await?;
//!
//!     let run_id = engine.trigger_verification("openai", "gpt-4o-mini").await?;
//!     let latest = engine.get_latest("openai", "gpt-4o-mini").await?;
//!     println!("{run_id}: score {:.2}", latest.score);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod engine;
pub mod events;
pub mod observability;
pub mod prelude;
pub mod probes;
pub mod registry;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod types;
pub mod verifier;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use auth::{ChainResolver, CredentialResolver, EnvironmentResolver, ExplicitResolver};
pub use catalog::{CatalogConfig, ModelCatalog};
pub use client::{
    AnthropicAdapter, CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, DialectAdapter,
    DispatchConfig, Dispatcher, ExponentialBackoff, HealthConfig, HealthProber, LatencyRouter,
    OpenAiAdapter, QuotaPolicy, ReqwestTransport, RouterConfig, TieBreak, Transport,
};
pub use config::{ConfigError, EngineSettings, SettingsValidator, StoreSettings};
pub use engine::{Engine, EngineBuilder, TriggerMode};
pub use events::{Event, EventBus, EventKind};
pub use observability::MetricsRegistry;
pub use probes::{CapabilityProbe, ProbeContext, ProbeSet};
pub use registry::ProviderRegistry;
pub use scheduler::{
    Cadence, JobState, Schedule, ScheduleError, Scheduler, SchedulerConfig, TargetSelector,
    TargetStatus,
};
pub use scoring::{ScoringPolicy, score};
pub use store::{MemoryStore, RunStore, StoreError};
#[cfg(feature = "jsonl")]
pub use store::{JsonlConfig, JsonlStore};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresStore};
pub use types::{
    Dialect, ModelCapabilities, ModelRecord, CatalogSource, ProbeOutcome, ProviderEndpoint,
    RateLimitPolicy, RunKey, RunStatus, VerificationRun,
};
pub use verifier::{Orchestrator, VerifierConfig};

/// Error type for verification engine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Connection reset, refused, DNS or 5xx failure; retryable within a run.
    #[error("Network request to {provider} failed: {message}")]
    NetworkTransient { provider: String, message: String },

    /// Call or probe exceeded its deadline.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Provider rejected the credential (401/403).
    #[error("Authentication rejected by {provider} (HTTP {status})")]
    AuthenticationInvalid { provider: String, status: u16 },

    /// Provider is reachable but refusing service (402/429).
    #[error("Quota exceeded for {provider}{}", match retry_after {
        Some(d) => format!(", retry in {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    QuotaExceeded {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// Response body could not be interpreted.
    #[error("Malformed response from {provider}: {message}")]
    MalformedResponse { provider: String, message: String },

    /// Circuit breaker rejected the call without a network attempt.
    #[error("Circuit open for {provider}, next attempt after {retry_at}")]
    CircuitOpen {
        provider: String,
        retry_at: DateTime<Utc>,
    },

    /// Provider disabled by configuration, credential failure or auth rejection.
    #[error("Provider {provider} is disabled: {reason}")]
    ProviderDisabled { provider: String, reason: String },

    /// Non-success status outside the classified ranges (400, 404, 422, ...).
    #[error("API error (HTTP {status}) from {provider}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] store::StoreError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] scheduler::ScheduleError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification recorded on failed probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NetworkTransient,
    Timeout,
    AuthenticationInvalid,
    QuotaExceeded,
    MalformedResponse,
    CircuitOpen,
    ProviderDisabled,
    InvalidRequest,
    NotFound,
    RubricFailed,
    Cancelled,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTransient => "network_transient",
            Self::Timeout => "timeout",
            Self::AuthenticationInvalid => "authentication_invalid",
            Self::QuotaExceeded => "quota_exceeded",
            Self::MalformedResponse => "malformed_response",
            Self::CircuitOpen => "circuit_open",
            Self::ProviderDisabled => "provider_disabled",
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::RubricFailed => "rubric_failed",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Classes after which further calls to the same provider this cycle are pointless.
    pub fn is_provider_level(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationInvalid
                | Self::QuotaExceeded
                | Self::CircuitOpen
                | Self::ProviderDisabled
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::NetworkTransient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::MalformedResponse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NetworkTransient { .. } => ErrorClass::NetworkTransient,
            Error::Timeout(_) => ErrorClass::Timeout,
            Error::AuthenticationInvalid { .. } => ErrorClass::AuthenticationInvalid,
            Error::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            Error::MalformedResponse { .. } | Error::Json(_) => ErrorClass::MalformedResponse,
            Error::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            Error::ProviderDisabled { .. } => ErrorClass::ProviderDisabled,
            Error::Api { status: 404, .. } | Error::NotFound { .. } => ErrorClass::NotFound,
            Error::Api { .. } => ErrorClass::InvalidRequest,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::Config(_)
            | Error::Storage(_)
            | Error::Schedule(_)
            | Error::Io(_) => ErrorClass::Internal,
        }
    }

    /// Whether the same call may succeed if issued again within this run.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NetworkTransient { .. } | Error::Timeout(_) => true,
            Error::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_provider_level(&self) -> bool {
        self.class().is_provider_level()
    }

    /// Whether this failure increments the provider's circuit-breaker counter.
    ///
    /// Transient network errors count only once the dispatch layer has
    /// exhausted its retries for the call.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::NetworkTransient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::Io(e) => Error::Io(e),
            config::ConfigError::Serialization(e) => Error::Json(e),
            other => Error::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
