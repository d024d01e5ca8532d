//! Observability for the verification engine.
//!
//! Structured logging goes through `tracing`; the crate never installs a
//! subscriber itself. Local counters, gauges and latency histograms are kept
//! in a [`MetricsRegistry`] shared by the dispatch layer, the orchestrator and
//! the scheduler.

mod metrics;

pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry, MetricsSummary};
