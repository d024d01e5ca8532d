use serde::{Deserialize, Serialize};

/// Request/response shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OpenAI-compatible chat completions (`/v1/chat/completions`).
    #[serde(alias = "openai", alias = "openai_compatible")]
    OpenAi,
    /// Anthropic messages (`/v1/messages`).
    Anthropic,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "open_ai",
            Dialect::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Admission limit on concurrent outbound calls to this provider.
    pub max_in_flight: usize,
    /// Default quota backoff when the provider omits `Retry-After`, in seconds.
    pub quota_backoff_secs: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            quota_backoff_secs: 60,
        }
    }
}

/// Configured provider. Holds a credential reference, never the secret itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
    pub dialect: Dialect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Relative price in [0, 1]; higher makes this provider less preferred when routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_weight: Option<f64>,
    /// Models to use when live discovery is unavailable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderEndpoint {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            dialect,
            credential_ref: None,
            rate_limit: RateLimitPolicy::default(),
            enabled: true,
            cost_weight: None,
            models: Vec::new(),
        }
    }

    pub fn with_credential_ref(mut self, reference: impl Into<String>) -> Self {
        self.credential_ref = Some(reference.into());
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.rate_limit.max_in_flight = max.max(1);
        self
    }

    pub fn with_cost_weight(mut self, weight: f64) -> Self {
        self.cost_weight = Some(weight.clamp(0.0, 1.0));
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Base URL joined with `path`, tolerating a trailing slash on either side.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
