//! Settings validation.
//!
//! Problems with engine-wide settings are errors. Problems with a single
//! provider entry only disable that provider.

use std::collections::HashSet;
use std::time::Duration;

use super::{ConfigError, ConfigResult, EngineSettings, ValidationErrors};
use crate::types::ProviderEndpoint;

/// Outcome of validating one settings document.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigError>,
    /// Providers to register disabled, with the reason.
    pub disabled_providers: Vec<(String, String)>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_disabled(&self, provider: &str) -> Option<&str> {
        self.disabled_providers
            .iter()
            .find(|(name, _)| name == provider)
            .map(|(_, reason)| reason.as_str())
    }

    /// Fail with every engine-wide error, or return the report for its provider findings.
    pub fn into_result(self) -> ConfigResult<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(self.errors)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsValidator {
    min_tick: Duration,
}

impl Default for SettingsValidator {
    fn default() -> Self {
        Self {
            min_tick: Duration::from_millis(10),
        }
    }
}

impl SettingsValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest accepted scheduler tick and health interval.
    pub fn min_tick(mut self, min_tick: Duration) -> Self {
        self.min_tick = min_tick;
        self
    }

    pub fn validate(&self, settings: &EngineSettings) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.check_engine(settings, &mut report.errors);

        let mut seen = HashSet::new();
        for endpoint in &settings.providers {
            if !seen.insert(endpoint.name.as_str()) {
                report.errors.push(ConfigError::invalid(
                    "providers",
                    format!("duplicate provider '{}'", endpoint.name),
                ));
                continue;
            }
            if let Err(reason) = check_provider(endpoint) {
                tracing::warn!(provider = %endpoint.name, %reason, "Invalid provider entry");
                report.disabled_providers.push((endpoint.name.clone(), reason));
            }
        }

        let mut names = HashSet::new();
        for schedule in &settings.schedules {
            let key = format!("schedules.{}", schedule.name);
            if !names.insert(schedule.name.as_str()) {
                report
                    .errors
                    .push(ConfigError::invalid(&key, "duplicate schedule name"));
            }
            if let Err(e) = schedule.cadence.validate() {
                report.errors.push(ConfigError::invalid(&key, e.to_string()));
            }
            for provider in &schedule.targets.providers {
                if !seen.contains(provider.as_str()) {
                    tracing::warn!(schedule = %schedule.name, provider, "Schedule targets unknown provider");
                }
            }
        }

        report
    }

    fn check_engine(&self, settings: &EngineSettings, errors: &mut Vec<ConfigError>) {
        let mut check = |ok: bool, key: &str, message: &str| {
            if !ok {
                errors.push(ConfigError::invalid(key, message));
            }
        };

        let dispatch = &settings.dispatch;
        check(
            !dispatch.call_timeout.is_zero(),
            "dispatch.call_timeout_ms",
            "must be positive",
        );
        check(
            dispatch.circuit.failure_threshold >= 1,
            "dispatch.circuit.failure_threshold",
            "must be at least 1",
        );
        check(
            dispatch.circuit.backoff_factor >= 1.0,
            "dispatch.circuit.backoff_factor",
            "must be at least 1.0",
        );
        check(
            dispatch.circuit.max_recovery_timeout >= dispatch.circuit.recovery_timeout,
            "dispatch.circuit.max_recovery_timeout",
            "must not be below recovery_timeout",
        );
        check(
            dispatch.stats_capacity >= 1,
            "dispatch.stats_capacity",
            "must be at least 1",
        );

        let router = &settings.router;
        check(
            (0.0..=1.0).contains(&router.cost_share),
            "router.cost_share",
            "must be within [0, 1]",
        );
        check(
            (0.0..=1.0).contains(&router.max_error_rate),
            "router.max_error_rate",
            "must be within [0, 1]",
        );
        check(
            router.cost_weights.values().all(|w| (0.0..=1.0).contains(w)),
            "router.cost_weights",
            "weights must be within [0, 1]",
        );

        let health = &settings.health;
        check(
            health.interval >= self.min_tick,
            "health.interval_ms",
            "below the minimum interval",
        );
        check(!health.timeout.is_zero(), "health.timeout_ms", "must be positive");

        let verifier = &settings.verifier;
        check(verifier.fan_out >= 1, "verifier.fan_out", "must be at least 1");
        check(
            verifier.min_passed >= 1,
            "verifier.min_passed",
            "must be at least 1",
        );
        check(
            !verifier.probe_timeout.is_zero(),
            "verifier.probe_timeout_ms",
            "must be positive",
        );

        check(
            !settings.catalog.ttl.is_zero(),
            "catalog.ttl_ms",
            "must be positive",
        );
        check(
            settings.scheduler.tick >= self.min_tick,
            "scheduler.tick_ms",
            "below the minimum tick",
        );
    }
}

fn check_provider(endpoint: &ProviderEndpoint) -> Result<(), String> {
    if endpoint.name.trim().is_empty() {
        return Err("provider name is empty".into());
    }
    let url = url::Url::parse(&endpoint.base_url)
        .map_err(|e| format!("base_url '{}': {}", endpoint.base_url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if endpoint.rate_limit.max_in_flight == 0 {
        return Err("rate_limit.max_in_flight must be at least 1".into());
    }
    if let Some(weight) = endpoint.cost_weight
        && !(0.0..=1.0).contains(&weight)
    {
        return Err(format!("cost_weight {weight} outside [0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Cadence, Schedule, TargetSelector};
    use crate::types::Dialect;

    #[test]
    fn test_default_settings_are_valid() {
        let report = SettingsValidator::new().validate(&EngineSettings::default());
        assert!(report.is_valid());
        assert!(report.disabled_providers.is_empty());
    }

    #[test]
    fn test_collects_all_engine_errors() {
        let mut settings = EngineSettings::default();
        settings.verifier.fan_out = 0;
        settings.router.cost_share = 1.5;
        settings.scheduler.tick = Duration::ZERO;
        settings = settings.with_schedule(Schedule::new(
            "broken",
            Cadence::cron("not a cron"),
            TargetSelector::default(),
        ));

        let report = SettingsValidator::new().validate(&settings);
        assert_eq!(report.errors.len(), 4);
        let err = report.into_result().unwrap_err().to_string();
        assert!(err.contains("verifier.fan_out"));
        assert!(err.contains("router.cost_share"));
        assert!(err.contains("schedules.broken"));
    }

    #[test]
    fn test_bad_provider_only_disables_it() {
        let settings = EngineSettings::default()
            .with_provider(ProviderEndpoint::new("good", "https://api.example.com", Dialect::OpenAi))
            .with_provider(ProviderEndpoint::new("bad", "not a url", Dialect::OpenAi))
            .with_provider(ProviderEndpoint {
                cost_weight: Some(3.0),
                ..ProviderEndpoint::new("pricey", "https://api.example.com", Dialect::OpenAi)
            });

        let report = SettingsValidator::new().validate(&settings);
        assert!(report.is_valid());
        assert!(report.is_disabled("good").is_none());
        assert!(report.is_disabled("bad").unwrap().contains("base_url"));
        assert!(report.is_disabled("pricey").unwrap().contains("cost_weight"));
    }

    #[test]
    fn test_duplicate_names() {
        let endpoint = ProviderEndpoint::new("a", "https://a.example.com", Dialect::OpenAi);
        let schedule = Schedule::new(
            "s",
            Cadence::every(Duration::from_secs(60)),
            TargetSelector::default(),
        );
        let settings = EngineSettings::default()
            .with_provider(endpoint.clone())
            .with_provider(endpoint)
            .with_schedule(schedule.clone())
            .with_schedule(schedule);
        assert_eq!(SettingsValidator::new().validate(&settings).errors.len(), 2);
    }
}
