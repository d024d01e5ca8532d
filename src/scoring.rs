//! Deterministic aggregation of probe outcomes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::ProbeOutcome;

pub const CORE_PROBES: [&str; 5] = [
    "protocol_compliance",
    "tool_invocation",
    "context_retention",
    "code_generation",
    "error_diagnosis",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Passed probes needed for `supported`.
    pub min_passed: usize,
    /// Probes every run is scored against; absent ones count as 0.
    pub expected: Vec<String>,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            min_passed: 3,
            expected: CORE_PROBES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ScoringPolicy {
    pub fn new(min_passed: usize, expected: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            min_passed,
            expected: expected.into_iter().map(Into::into).collect(),
        }
    }

    /// `(overall, supported)`.
    ///
    /// The denominator is every distinct probe in `expected` or `outcomes`, so
    /// a missing probe lowers the mean instead of being excluded. Failed
    /// outcomes contribute 0. Duplicate outcomes for one probe keep the first.
    pub fn score(&self, outcomes: &[ProbeOutcome]) -> (f64, bool) {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut total = 0.0;
        let mut passed = 0usize;

        for outcome in outcomes {
            if !seen.insert(outcome.probe.as_str()) {
                continue;
            }
            if outcome.passed {
                passed += 1;
                total += sanitize(outcome.score);
            }
        }

        let missing = self
            .expected
            .iter()
            .filter(|name| !seen.contains(name.as_str()))
            .collect::<HashSet<_>>()
            .len();
        let denominator = seen.len() + missing;

        let overall = if denominator == 0 {
            0.0
        } else {
            total / denominator as f64
        };
        (overall, passed >= self.min_passed && denominator > 0)
    }
}

fn sanitize(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Score with the default policy: at least 3 of the 5 core probes passing.
pub fn score(outcomes: &[ProbeOutcome]) -> (f64, bool) {
    ScoringPolicy::default().score(outcomes)
}
