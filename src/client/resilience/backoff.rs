//! Exponential backoff for transient-failure and persistence retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    #[serde(rename = "initial_ms", with = "millis")]
    initial: Duration,
    #[serde(rename = "max_ms", with = "millis")]
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    /// Symmetric jitter as a fraction of the computed delay.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let jitter_range = clamped * self.jitter;
            let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (clamped + jitter_offset).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }

    /// Delay for `attempt`, or `None` when it would not fit in `remaining`.
    pub fn delay_within(&self, attempt: u32, remaining: Duration) -> Option<Duration> {
        let delay = self.delay_for(attempt);
        (delay < remaining).then_some(delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
                .with_jitter(0.0);

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0)
                .with_jitter(0.0);
        assert_eq!(backoff.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_secs(10), 2.0)
                .with_jitter(0.1);
        for _ in 0..50 {
            let d = backoff.delay_for(1).as_millis();
            assert!((900..=1100).contains(&d), "{d}");
        }
    }

    #[test]
    fn test_delay_within_deadline() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0)
                .with_jitter(0.0);
        assert_eq!(
            backoff.delay_within(1, Duration::from_secs(1)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(backoff.delay_within(1, Duration::from_millis(50)), None);
    }

    #[test]
    fn test_deserialize_from_millis() {
        let backoff: ExponentialBackoff =
            serde_json::from_str(r#"{"initial_ms": 50, "max_ms": 400}"#).unwrap();
        assert_eq!(backoff.with_jitter(0.0).delay_for(4), Duration::from_millis(400));
    }
}
