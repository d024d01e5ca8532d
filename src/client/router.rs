//! Latency-aware routing across providers that serve the same model.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Ascending provider name.
    #[default]
    ProviderName,
    /// Position in this list; unlisted providers follow, by name.
    Priority(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Weight of cheapness (`1 - cost_weight`) against the latency score, in [0, 1].
    pub cost_share: f64,
    /// Candidates whose recent error rate exceeds this are not routed to.
    pub max_error_rate: f64,
    pub tie_break: TieBreak,
    /// Relative price per provider in [0, 1]; higher is more expensive.
    pub cost_weights: HashMap<String, f64>,
    pub default_cost_weight: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let cost_weights = [
            ("openai", 0.8),
            ("anthropic", 0.7),
            ("google", 0.6),
            ("mistral", 0.7),
            ("meta", 0.3),
            ("groq", 0.8),
            ("togetherai", 0.6),
            ("fireworks", 0.6),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            cost_share: 0.7,
            max_error_rate: 0.25,
            tie_break: TieBreak::ProviderName,
            cost_weights,
            default_cost_weight: 0.5,
        }
    }
}

impl RouterConfig {
    pub fn cost_weight(&self, provider: &str) -> f64 {
        self.cost_weights
            .get(provider)
            .copied()
            .unwrap_or(self.default_cost_weight)
    }
}

/// Routing inputs for one provider.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub name: String,
    /// Recent median latency of successful calls; `None` without samples.
    pub p50: Option<Duration>,
    pub error_rate: Option<f64>,
    /// Endpoint override; the router's table applies when `None`.
    pub cost_weight: Option<f64>,
    /// False when disabled, in quota backoff or rejected by its circuit.
    pub available: bool,
}

impl Candidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            p50: None,
            error_rate: None,
            cost_weight: None,
            available: true,
        }
    }

    pub fn with_latency(mut self, p50: Duration) -> Self {
        self.p50 = Some(p50);
        self
    }

    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = Some(rate);
        self
    }

    pub fn with_cost_weight(mut self, weight: f64) -> Self {
        self.cost_weight = Some(weight);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct LatencyRouter {
    config: RouterConfig,
}

impl LatencyRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Eligible candidates, best first.
    pub fn rank(&self, candidates: &[Candidate]) -> Vec<String> {
        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.available)
            .filter(|c| c.error_rate.is_none_or(|r| r <= self.config.max_error_rate))
            .collect();

        let best_p50 = eligible
            .iter()
            .filter_map(|c| c.p50)
            .min()
            .map(|d| d.as_secs_f64().max(f64::EPSILON));

        let mut scored: Vec<(&Candidate, Option<f64>)> = eligible
            .into_iter()
            .map(|c| {
                let score = c.p50.zip(best_p50).map(|(p50, best)| {
                    let latency_score = best / p50.as_secs_f64().max(f64::EPSILON);
                    let cost = c
                        .cost_weight
                        .unwrap_or_else(|| self.config.cost_weight(&c.name));
                    let cheapness = 1.0 - cost.clamp(0.0, 1.0);
                    self.config.cost_share * cheapness
                        + (1.0 - self.config.cost_share) * latency_score
                });
                (c, score)
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| match (sa, sb) {
            (Some(x), Some(y)) => y
                .partial_cmp(x)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.tie_break(&a.name, &b.name)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.tie_break(&a.name, &b.name),
        });

        scored.into_iter().map(|(c, _)| c.name.clone()).collect()
    }

    pub fn select(&self, candidates: &[Candidate]) -> Option<String> {
        self.rank(candidates).into_iter().next()
    }

    fn tie_break(&self, a: &str, b: &str) -> Ordering {
        match &self.config.tie_break {
            TieBreak::ProviderName => a.cmp(b),
            TieBreak::Priority(order) => {
                let pos = |n: &str| order.iter().position(|p| p == n).unwrap_or(usize::MAX);
                pos(a).cmp(&pos(b)).then_with(|| a.cmp(b))
            }
        }
    }
}
