//! Rolling latency and success statistics per provider.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
    success: bool,
}

/// Bounded window of recent call samples plus a long-running moving average.
#[derive(Debug)]
pub struct RollingStats {
    samples: VecDeque<Sample>,
    capacity: usize,
    max_age: Duration,
    ema_ms: Option<f64>,
    min: Option<Duration>,
    max: Option<Duration>,
    total: u64,
    last_sample_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub sample_count: usize,
    pub p50_ms: Option<u64>,
    pub success_rate: Option<f64>,
    pub ema_ms: Option<f64>,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub total_samples: u64,
    pub last_sample_at: Option<DateTime<Utc>>,
}

impl RollingStats {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_age,
            ema_ms: None,
            min: None,
            max: None,
            total: 0,
            last_sample_at: None,
        }
    }

    pub fn record(&mut self, latency: Duration, success: bool) {
        let now = Instant::now();
        self.prune(now);
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            at: now,
            latency,
            success,
        });
        self.total += 1;
        self.last_sample_at = Some(Utc::now());

        if success {
            let ms = latency.as_secs_f64() * 1000.0;
            self.ema_ms = Some(match self.ema_ms {
                None => ms,
                Some(prev) => prev * (1.0 - EMA_ALPHA) + ms * EMA_ALPHA,
            });
            self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
            self.max = Some(self.max.map_or(latency, |m| m.max(latency)));
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.at) > self.max_age)
        {
            self.samples.pop_front();
        }
    }

    fn live(&self) -> impl Iterator<Item = &Sample> {
        let now = Instant::now();
        self.samples
            .iter()
            .filter(move |s| now.duration_since(s.at) <= self.max_age)
    }

    /// Median latency of successful samples in the window.
    pub fn p50(&self) -> Option<Duration> {
        let mut latencies: Vec<Duration> =
            self.live().filter(|s| s.success).map(|s| s.latency).collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort();
        Some(latencies[(latencies.len() - 1) / 2])
    }

    pub fn success_rate(&self) -> Option<f64> {
        let (ok, total) = self
            .live()
            .fold((0usize, 0usize), |(ok, total), s| (ok + s.success as usize, total + 1));
        (total > 0).then(|| ok as f64 / total as f64)
    }

    pub fn error_rate(&self) -> Option<f64> {
        self.success_rate().map(|r| 1.0 - r)
    }

    pub fn sample_count(&self) -> usize {
        self.live().count()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sample_count: self.sample_count(),
            p50_ms: self.p50().map(|d| d.as_millis() as u64),
            success_rate: self.success_rate(),
            ema_ms: self.ema_ms,
            min_ms: self.min.map(|d| d.as_millis() as u64),
            max_ms: self.max.map(|d| d.as_millis() as u64),
            total_samples: self.total,
            last_sample_at: self.last_sample_at,
        }
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_empty_stats() {
        let stats = RollingStats::default();
        assert_eq!(stats.p50(), None);
        assert_eq!(stats.success_rate(), None);
    }

    #[test]
    fn test_p50_ignores_failures() {
        let mut stats = RollingStats::default();
        stats.record(ms(10), true);
        stats.record(ms(30), true);
        stats.record(ms(20), true);
        stats.record(ms(5000), false);

        assert_eq!(stats.p50(), Some(ms(20)));
        assert_eq!(stats.success_rate(), Some(0.75));
        assert_eq!(stats.error_rate(), Some(0.25));
    }

    #[test]
    fn test_capacity_bounds_window() {
        let mut stats = RollingStats::new(3, Duration::from_secs(60));
        for v in [100, 100, 100, 1, 1, 1] {
            stats.record(ms(v), true);
        }
        assert_eq!(stats.sample_count(), 3);
        assert_eq!(stats.p50(), Some(ms(1)));
        assert_eq!(stats.snapshot().total_samples, 6);
    }

    #[test]
    fn test_ema_and_extremes() {
        let mut stats = RollingStats::default();
        stats.record(ms(100), true);
        stats.record(ms(200), true);
        let snap = stats.snapshot();
        assert!((snap.ema_ms.unwrap() - 110.0).abs() < 1e-6);
        assert_eq!(snap.min_ms, Some(100));
        assert_eq!(snap.max_ms, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_age_out() {
        let mut stats = RollingStats::new(10, Duration::from_secs(5));
        stats.record(ms(10), true);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(stats.sample_count(), 0);
        assert_eq!(stats.p50(), None);
    }
}
