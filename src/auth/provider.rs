//! Credential resolver trait.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::Result;

/// Maps a credential reference to a secret value.
#[async_trait]
pub trait CredentialResolver: Send + Sync + std::fmt::Debug {
    /// Resolver name for debugging.
    fn name(&self) -> &str;

    /// Resolve `reference`; `Error::NotFound` when this resolver has no value for it.
    async fn resolve(&self, reference: &str) -> Result<SecretString>;
}
