//! Engine settings file with environment overrides.
//!
//! Settings load from a JSON document and may then be overridden by
//! `LLM_VERIFIER_*` variables. A variable name is the dotted settings path
//! upper-cased with `_` separators, so `LLM_VERIFIER_DISPATCH_CIRCUIT_FAILURE_THRESHOLD`
//! sets `dispatch.circuit.failure_threshold`. Only scalar settings can be
//! overridden; lists such as providers and schedules come from the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConfigError, ConfigResult};
use crate::catalog::CatalogConfig;
use crate::client::{DispatchConfig, HealthConfig, RouterConfig};
use crate::scheduler::{Schedule, SchedulerConfig};
use crate::types::ProviderEndpoint;
use crate::verifier::VerifierConfig;

pub const ENV_PREFIX: &str = "LLM_VERIFIER_";

/// Where verification runs are persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreSettings {
    /// Process memory; history is lost on exit.
    #[default]
    Memory,
    /// Append-only JSON lines under `path` (platform data directory when unset).
    Jsonl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(default)]
        sync_on_write: bool,
    },
    Postgres {
        url: String,
        #[serde(default = "default_table_prefix")]
        table_prefix: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_table_prefix() -> String {
    "llm_verifier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub providers: Vec<ProviderEndpoint>,
    pub schedules: Vec<Schedule>,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub router: RouterConfig,
    pub verifier: VerifierConfig,
    pub catalog: CatalogConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreSettings,
}

impl EngineSettings {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file. A missing file is an error.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&content)?;
        tracing::debug!(
            path = %path.display(),
            providers = settings.providers.len(),
            schedules = settings.schedules.len(),
            "Loaded settings"
        );
        Ok(settings)
    }

    /// Apply `LLM_VERIFIER_*` variables from the process environment.
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply prefixed overrides from any `(name, value)` source.
    ///
    /// Names that match no scalar setting are logged and ignored.
    pub fn apply_overrides<I, K, V>(self, vars: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tree = serde_json::to_value(&self)?;
        let mut applied = 0usize;

        for (name, raw) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_lowercase();
            let Some(path) = locate(&tree, &key) else {
                tracing::warn!(variable = name.as_ref(), "Ignoring unknown settings override");
                continue;
            };
            let dotted = path.join(".");
            let pointer = format!("/{}", path.join("/"));
            if let Some(slot) = tree.pointer_mut(&pointer) {
                *slot = coerce(&dotted, slot, raw.as_ref())?;
                applied += 1;
            }
        }

        if applied == 0 {
            return Ok(self);
        }
        tracing::debug!(applied, "Applied settings overrides");
        Ok(serde_json::from_value(tree)?)
    }

    /// Set one scalar setting by dotted path, e.g. `verifier.fan_out`.
    pub fn set(self, key: &str, value: &str) -> ConfigResult<Self> {
        let mut tree = serde_json::to_value(&self)?;
        let pointer = format!("/{}", key.replace('.', "/"));
        match tree.pointer_mut(&pointer) {
            Some(slot) if is_scalar(slot) => *slot = coerce(key, slot, value)?,
            _ => return Err(ConfigError::UnknownKey { key: key.to_string() }),
        }
        Ok(serde_json::from_value(tree)?)
    }

    pub fn with_provider(mut self, endpoint: ProviderEndpoint) -> Self {
        self.providers.push(endpoint);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedules.push(schedule);
        self
    }

    pub fn with_store(mut self, store: StoreSettings) -> Self {
        self.store = store;
        self
    }

    pub fn with_verifier(mut self, verifier: VerifierConfig) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }
}

fn is_scalar(value: &Value) -> bool {
    !value.is_object() && !value.is_array()
}

/// Path of the scalar setting whose fields, joined by `_`, spell `key`.
fn locate(node: &Value, key: &str) -> Option<Vec<String>> {
    let object = node.as_object()?;
    for (name, value) in object {
        if key == name && is_scalar(value) {
            return Some(vec![name.clone()]);
        }
        if value.is_object()
            && let Some(rest) = key
                .strip_prefix(name.as_str())
                .and_then(|r| r.strip_prefix('_'))
            && let Some(mut path) = locate(value, rest)
        {
            path.insert(0, name.clone());
            return Some(path);
        }
    }
    None
}

/// Parse `raw` into the JSON type the setting currently holds.
fn coerce(key: &str, current: &Value, raw: &str) -> ConfigResult<Value> {
    let raw = raw.trim();
    match current {
        Value::String(_) => Ok(Value::String(raw.to_string())),
        Value::Bool(_) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(ConfigError::invalid(key, format!("expected a boolean, got '{raw}'"))),
        },
        Value::Number(_) => match serde_json::from_str::<Value>(raw) {
            Ok(number @ Value::Number(_)) => Ok(number),
            _ => Err(ConfigError::invalid(key, format!("expected a number, got '{raw}'"))),
        },
        _ => Ok(serde_json::from_str::<Value>(raw)
            .ok()
            .filter(is_scalar)
            .unwrap_or_else(|| Value::String(raw.to_string()))),
    }
}
