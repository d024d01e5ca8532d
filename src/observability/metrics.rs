//! Metrics collection.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::types::RunStatus;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Count per bucket; the last entry is the overflow bucket.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Sum in the observed unit (ms); stored scaled by 1000.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Engine-wide metrics.
#[derive(Debug)]
pub struct MetricsRegistry {
    pub dispatch_calls: Counter,
    pub dispatch_success: Counter,
    pub dispatch_failures: Counter,
    pub dispatch_retries: Counter,
    pub circuit_rejections: Counter,
    pub quota_rejections: Counter,
    pub disabled_rejections: Counter,
    pub in_flight: Gauge,
    pub dispatch_latency_ms: Histogram,
    pub probe_latency_ms: Histogram,
    pub runs_succeeded: Counter,
    pub runs_failed: Counter,
    pub runs_aborted: Counter,
    pub active_runs: Gauge,
    pub persistence_retries: Counter,
    pub schedule_fires: Counter,
    pub schedule_skips: Counter,
    pub catalog_fallbacks: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            dispatch_calls: Counter::new(),
            dispatch_success: Counter::new(),
            dispatch_failures: Counter::new(),
            dispatch_retries: Counter::new(),
            circuit_rejections: Counter::new(),
            quota_rejections: Counter::new(),
            disabled_rejections: Counter::new(),
            in_flight: Gauge::new(),
            dispatch_latency_ms: Histogram::default_latency(),
            probe_latency_ms: Histogram::default_latency(),
            runs_succeeded: Counter::new(),
            runs_failed: Counter::new(),
            runs_aborted: Counter::new(),
            active_runs: Gauge::new(),
            persistence_retries: Counter::new(),
            schedule_fires: Counter::new(),
            schedule_skips: Counter::new(),
            catalog_fallbacks: Counter::new(),
        }
    }

    pub fn record_dispatch_start(&self) {
        self.dispatch_calls.inc();
        self.in_flight.inc();
    }

    pub fn record_dispatch_end(&self, success: bool, latency_ms: f64) {
        self.in_flight.dec();
        self.dispatch_latency_ms.observe(latency_ms);
        if success {
            self.dispatch_success.inc();
        } else {
            self.dispatch_failures.inc();
        }
    }

    pub fn record_run(&self, status: RunStatus) {
        match status {
            RunStatus::Succeeded => self.runs_succeeded.inc(),
            RunStatus::Failed => self.runs_failed.inc(),
            RunStatus::Aborted => self.runs_aborted.inc(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub dispatch_calls: u64,
    pub dispatch_success: u64,
    pub dispatch_failures: u64,
    pub circuit_rejections: u64,
    pub quota_rejections: u64,
    pub runs_total: u64,
    pub runs_succeeded: u64,
    pub schedule_skips: u64,
    pub avg_dispatch_latency_ms: f64,
    pub avg_probe_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let avg = |h: &Histogram| {
            let count = h.count();
            if count > 0 {
                h.sum_ms() / count as f64
            } else {
                0.0
            }
        };

        Self {
            dispatch_calls: registry.dispatch_calls.get(),
            dispatch_success: registry.dispatch_success.get(),
            dispatch_failures: registry.dispatch_failures.get(),
            circuit_rejections: registry.circuit_rejections.get(),
            quota_rejections: registry.quota_rejections.get(),
            runs_total: registry.runs_succeeded.get()
                + registry.runs_failed.get()
                + registry.runs_aborted.get(),
            runs_succeeded: registry.runs_succeeded.get(),
            schedule_skips: registry.schedule_skips.get(),
            avg_dispatch_latency_ms: avg(&registry.dispatch_latency_ms),
            avg_probe_latency_ms: avg(&registry.probe_latency_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_goes_negative_without_panic() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), -1);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0]);
        hist.observe(5.0);
        hist.observe(25.0);
        hist.observe(75.0);
        hist.observe(150.0);
        assert_eq!(hist.count(), 4);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1, 1]);
        assert!((hist.sum_ms() - 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary() {
        let registry = MetricsRegistry::default();
        registry.record_dispatch_start();
        registry.record_dispatch_end(true, 40.0);
        registry.record_dispatch_start();
        registry.record_dispatch_end(false, 60.0);
        registry.record_run(RunStatus::Succeeded);
        registry.record_run(RunStatus::Aborted);

        let summary = MetricsSummary::from_registry(&registry);
        assert_eq!(summary.dispatch_calls, 2);
        assert_eq!(summary.dispatch_failures, 1);
        assert_eq!(summary.runs_total, 2);
        assert_eq!(summary.avg_dispatch_latency_ms, 50.0);
        assert_eq!(registry.in_flight.get(), 0);
    }
}
