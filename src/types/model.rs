use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub tool_calling: bool,
    #[serde(default)]
    pub vision: bool,
}

/// Where a model record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSource {
    /// Provider's own discovery endpoint.
    Live,
    /// Models listed on the provider configuration entry.
    Configured,
    /// Builtin catalog shipped with the crate.
    StaticFallback,
}

/// One model as seen at one discovery time. Rediscovery appends a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub provider: String,
    pub model_id: String,
    pub display_name: String,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    pub discovered_at: DateTime<Utc>,
    pub source: CatalogSource,
}

impl ModelRecord {
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        source: CatalogSource,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            provider: provider.into(),
            display_name: model_id.clone(),
            model_id,
            capabilities: ModelCapabilities::default(),
            discovered_at: Utc::now().trunc_subsecs(6),
            source,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_discovered_at(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at.trunc_subsecs(6);
        self
    }
}
