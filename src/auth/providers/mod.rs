//! Credential resolver implementations.

mod chain;
mod environment;
mod explicit;

pub use chain::ChainResolver;
pub use environment::EnvironmentResolver;
pub use explicit::ExplicitResolver;
