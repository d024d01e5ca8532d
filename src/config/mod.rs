//! Engine configuration.
//!
//! ```rust,no_run
//! use llm_verifier::config::EngineSettings;
//!
//! # fn example() -> Result<(), llm_verifier::config::ConfigError> {
//! let settings = EngineSettings::from_file("verifier.json")?.apply_env()?;
//! # Ok(())
//! # }
//! ```

mod settings;
mod validator;

pub use settings::{ENV_PREFIX, EngineSettings, StoreSettings};
pub use validator::{SettingsValidator, ValidationReport};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown setting: {key}")]
    UnknownKey { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
