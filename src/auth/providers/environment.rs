//! Environment variable credential resolver.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::auth::CredentialResolver;
use crate::{Error, Result};

/// Resolves references as environment variable names.
///
/// A reference may be written `env:NAME` or plain `NAME`. An optional prefix
/// is prepended to the variable name.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentResolver {
    prefix: Option<String>,
}

impl EnvironmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn var_name(&self, reference: &str) -> String {
        let name = reference.strip_prefix("env:").unwrap_or(reference);
        match &self.prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }
}

#[async_trait]
impl CredentialResolver for EnvironmentResolver {
    fn name(&self) -> &str {
        "environment"
    }

    async fn resolve(&self, reference: &str) -> Result<SecretString> {
        let var = self.var_name(reference);
        match std::env::var(&var) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            _ => Err(Error::not_found("credential", var)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_environment_resolver_missing() {
        // SAFETY: Test-only environment setup, single-threaded test context
        unsafe { std::env::remove_var("LLMV_TEST_KEY_NOT_SET") };
        let resolver = EnvironmentResolver::new();
        assert!(resolver.resolve("LLMV_TEST_KEY_NOT_SET").await.is_err());
    }

    #[tokio::test]
    async fn test_environment_resolver_set() {
        // SAFETY: Test-only environment setup, single-threaded test context
        unsafe { std::env::set_var("LLMV_TEST_KEY_SET", "sk-test") };
        let resolver = EnvironmentResolver::new();
        let secret = resolver.resolve("env:LLMV_TEST_KEY_SET").await.unwrap();
        assert_eq!(secret.expose_secret(), "sk-test");
        unsafe { std::env::remove_var("LLMV_TEST_KEY_SET") };
    }

    #[tokio::test]
    async fn test_blank_value_is_missing() {
        // SAFETY: Test-only environment setup, single-threaded test context
        unsafe { std::env::set_var("LLMV_TEST_KEY_BLANK", "  ") };
        let resolver = EnvironmentResolver::new();
        assert!(resolver.resolve("LLMV_TEST_KEY_BLANK").await.is_err());
        unsafe { std::env::remove_var("LLMV_TEST_KEY_BLANK") };
    }

    #[test]
    fn test_prefixed_var_name() {
        let resolver = EnvironmentResolver::with_prefix("LLMV_");
        assert_eq!(resolver.var_name("env:GROQ"), "LLMV_GROQ");
    }
}
