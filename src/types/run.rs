use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ErrorClass;

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

fn whole_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Result of one probe within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub probe: String,
    pub passed: bool,
    pub score: f64,
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClass>,
}

impl ProbeOutcome {
    /// Rubric evaluated; `passed` follows from the rubric, `score` is clamped to [0, 1].
    pub fn evaluated(
        probe: impl Into<String>,
        passed: bool,
        score: f64,
        latency: Duration,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            probe: probe.into(),
            passed,
            score: score.clamp(0.0, 1.0),
            latency: whole_millis(latency),
            evidence: evidence.into(),
            classification: (!passed).then_some(ErrorClass::RubricFailed),
        }
    }

    pub fn failed(
        probe: impl Into<String>,
        class: ErrorClass,
        latency: Duration,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            probe: probe.into(),
            passed: false,
            score: 0.0,
            latency: whole_millis(latency),
            evidence: evidence.into(),
            classification: Some(class),
        }
    }

    /// Probe never issued a call (circuit open, provider short-circuited).
    pub fn skipped(probe: impl Into<String>, class: ErrorClass, evidence: impl Into<String>) -> Self {
        Self::failed(probe, class, Duration::ZERO, evidence)
    }
}

/// Identity of one attempt; unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub provider: String,
    pub model: String,
    pub attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every probe ran against a reachable provider.
    Succeeded,
    /// Provider-level failure or unknown model; outcomes carry the root cause.
    Failed,
    /// Cancelled before all probes could execute.
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One complete execution of the probe battery. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRun {
    pub run_id: Uuid,
    pub provider: String,
    pub model: String,
    pub attempt_at: DateTime<Utc>,
    pub outcomes: Vec<ProbeOutcome>,
    pub score: f64,
    pub supported: bool,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub status: RunStatus,
}

impl VerificationRun {
    /// Attempt timestamp truncated to microseconds so every backend stores it exactly.
    pub fn attempt_timestamp() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    pub fn key(&self) -> RunKey {
        RunKey {
            provider: self.provider.clone(),
            model: self.model.clone(),
            attempt_at: self.attempt_at,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn outcome(&self, probe: &str) -> Option<&ProbeOutcome> {
        self.outcomes.iter().find(|o| o.probe == probe)
    }

    /// Whole-millisecond duration, matching what storage retains.
    pub fn normalized_duration(d: Duration) -> Duration {
        whole_millis(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_latency_truncated_to_millis() {
        let outcome = ProbeOutcome::evaluated(
            "code_generation",
            true,
            1.0,
            Duration::from_micros(12_345),
            "def factorial",
        );
        assert_eq!(outcome.latency, Duration::from_millis(12));
        assert!(outcome.classification.is_none());
    }

    #[test]
    fn test_failed_rubric_is_classified() {
        let outcome = ProbeOutcome::evaluated("x", false, 0.2, Duration::ZERO, "no code");
        assert_eq!(outcome.classification, Some(ErrorClass::RubricFailed));
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let outcome = ProbeOutcome::failed(
            "tool_invocation",
            ErrorClass::Timeout,
            Duration::from_secs(30),
            "deadline elapsed",
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["latency_ms"], 30_000);
        assert_eq!(json["classification"], "timeout");
        assert_eq!(json["passed"], false);
    }

    #[test]
    fn test_run_status_parse() {
        assert_eq!("aborted".parse::<RunStatus>().unwrap(), RunStatus::Aborted);
        assert!("bogus".parse::<RunStatus>().is_err());
    }
}
