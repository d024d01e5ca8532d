//! Credential resolution.
//!
//! Provider configuration carries a credential *reference*; the secret is
//! looked up at call time through a [`CredentialResolver`]. Resolution fails
//! closed: a reference that cannot be resolved disables the provider instead
//! of sending an empty secret downstream.

mod provider;
mod providers;

pub use provider::CredentialResolver;
pub use providers::{ChainResolver, EnvironmentResolver, ExplicitResolver};
