//! Prelude module for convenient imports.
//!
//! ```rust
//! use llm_verifier::prelude::*;
//! ```

pub use crate::Error;
pub use crate::ErrorClass;
pub use crate::Result;

// Engine
pub use crate::config::EngineSettings;
pub use crate::engine::{Engine, EngineBuilder, TriggerMode};
pub use crate::events::{Event, EventKind};

// Providers and dispatch
pub use crate::client::{CallContext, ChatRequest, ChatResponse, Dispatcher, Transport};
pub use crate::registry::ProviderRegistry;
pub use crate::types::{Dialect, ProviderEndpoint};

// Verification
pub use crate::probes::{CapabilityProbe, ProbeContext, ProbeSet, Verdict};
pub use crate::scheduler::{Cadence, Schedule, TargetSelector};
pub use crate::store::RunStore;
pub use crate::types::{ProbeOutcome, RunStatus, VerificationRun};
