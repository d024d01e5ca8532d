//! Capability probes.
//!
//! A probe is a static definition: a request template, an optional timeout and
//! a rubric that turns the provider's answer into a [`Verdict`]. Probes are
//! independent of each other, so a run may execute them concurrently.

mod battery;
mod extended;

pub use battery::{
    CodeGenerationProbe, ContextRetentionProbe, ErrorDiagnosisProbe, ProtocolComplianceProbe,
    ToolInvocationProbe,
};
pub use extended::{JsonModeProbe, ReasoningProbe, StreamingProbe};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;
use crate::client::{CallContext, ChatRequest, ChatResponse, Dispatcher};

/// Rubric result for one probe response.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub score: f64,
    pub evidence: String,
}

impl Verdict {
    pub fn pass(score: f64, evidence: impl Into<String>) -> Self {
        Self {
            passed: true,
            score,
            evidence: evidence.into(),
        }
    }

    pub fn fail(evidence: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            evidence: evidence.into(),
        }
    }
}

/// Everything a probe needs to issue its calls.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub dispatcher: Dispatcher,
    pub provider: String,
    pub model: String,
    /// Deadline and cancellation for this probe.
    pub call: CallContext,
}

#[async_trait]
pub trait CapabilityProbe: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Probe-specific timeout; the orchestrator's default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn request(&self, model: &str) -> ChatRequest;

    fn evaluate(&self, response: &ChatResponse) -> Verdict;

    /// Issue the request through the dispatcher and apply the rubric.
    async fn run(&self, ctx: &ProbeContext) -> Result<Verdict> {
        let request = self.request(&ctx.model);
        let response = ctx.dispatcher.call(&ctx.provider, &request, &ctx.call).await?;
        Ok(self.evaluate(&response))
    }
}

/// Ordered battery of probes run against each model.
#[derive(Debug, Clone)]
pub struct ProbeSet {
    probes: Vec<Arc<dyn CapabilityProbe>>,
}

impl ProbeSet {
    pub fn empty() -> Self {
        Self { probes: Vec::new() }
    }

    /// The five core probes.
    pub fn core() -> Self {
        Self {
            probes: vec![
                Arc::new(ProtocolComplianceProbe),
                Arc::new(ToolInvocationProbe),
                Arc::new(ContextRetentionProbe),
                Arc::new(CodeGenerationProbe),
                Arc::new(ErrorDiagnosisProbe),
            ],
        }
    }

    /// Core probes plus streaming, JSON mode and reasoning.
    pub fn extended() -> Self {
        Self::core()
            .with(Arc::new(StreamingProbe))
            .with(Arc::new(JsonModeProbe))
            .with(Arc::new(ReasoningProbe))
    }

    /// Add a probe; a probe with the same name is replaced in place.
    pub fn with(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        match self.probes.iter().position(|p| p.name() == probe.name()) {
            Some(i) => self.probes[i] = probe,
            None => self.probes.push(probe),
        }
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CapabilityProbe>> {
        self.probes.iter()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self::core()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_battery() {
        let set = ProbeSet::core();
        assert_eq!(
            set.names(),
            vec![
                "protocol_compliance",
                "tool_invocation",
                "context_retention",
                "code_generation",
                "error_diagnosis"
            ]
        );
        assert_eq!(ProbeSet::extended().len(), 8);
    }

    #[test]
    fn test_with_replaces_same_name() {
        let set = ProbeSet::core().with(Arc::new(ProtocolComplianceProbe));
        assert_eq!(set.len(), 5);
        assert!(ProbeSet::empty().is_empty());
    }
}
