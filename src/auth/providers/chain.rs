//! Chain credential resolver.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::auth::{CredentialResolver, EnvironmentResolver};
use crate::{Error, Result};

/// Resolver that tries multiple resolvers in order.
#[derive(Debug, Clone)]
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn CredentialResolver>>,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Arc<dyn CredentialResolver>>) -> Self {
        Self { resolvers }
    }

    /// Add a resolver to the end of the chain.
    pub fn with<R: CredentialResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }
}

impl Default for ChainResolver {
    fn default() -> Self {
        Self {
            resolvers: vec![Arc::new(EnvironmentResolver::new())],
        }
    }
}

#[async_trait]
impl CredentialResolver for ChainResolver {
    fn name(&self) -> &str {
        "chain"
    }

    async fn resolve(&self, reference: &str) -> Result<SecretString> {
        let mut tried = Vec::new();

        for resolver in &self.resolvers {
            match resolver.resolve(reference).await {
                Ok(secret) => {
                    tracing::debug!(reference, resolver = resolver.name(), "Credential resolved");
                    return Ok(secret);
                }
                Err(e) => {
                    tracing::debug!(reference, resolver = resolver.name(), error = %e, "Resolver miss");
                    tried.push(resolver.name().to_string());
                }
            }
        }

        Err(Error::not_found(
            "credential",
            format!("{} (tried: {})", reference, tried.join(", ")),
        ))
    }
}
