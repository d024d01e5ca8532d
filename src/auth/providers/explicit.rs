//! Explicit credential resolver.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::auth::CredentialResolver;
use crate::{Error, Result};

/// Resolver backed by an in-memory reference table.
#[derive(Debug, Default, Clone)]
pub struct ExplicitResolver {
    secrets: HashMap<String, SecretString>,
}

impl ExplicitResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets
            .insert(reference.into(), SecretString::from(secret.into()));
        self
    }
}

#[async_trait]
impl CredentialResolver for ExplicitResolver {
    fn name(&self) -> &str {
        "explicit"
    }

    async fn resolve(&self, reference: &str) -> Result<SecretString> {
        self.secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::not_found("credential", reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_explicit_lookup() {
        let resolver = ExplicitResolver::new().with("openai", "sk-1");
        let secret = resolver.resolve("openai").await.unwrap();
        assert_eq!(secret.expose_secret(), "sk-1");
        assert!(resolver.resolve("anthropic").await.is_err());
    }
}
