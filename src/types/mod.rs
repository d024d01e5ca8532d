//! Core data model shared by every engine component.

mod model;
mod provider;
mod run;

pub use model::{CatalogSource, ModelCapabilities, ModelRecord};
pub use provider::{Dialect, ProviderEndpoint, RateLimitPolicy};
pub use run::{ProbeOutcome, RunKey, RunStatus, VerificationRun, duration_ms};
