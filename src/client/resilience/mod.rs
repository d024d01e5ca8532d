//! Resilience primitives for the dispatch layer.
//!
//! Per-provider circuit breaking, retry backoff and rolling call statistics.

mod backoff;
mod circuit;
mod stats;

pub use backoff::ExponentialBackoff;
pub use circuit::{Admission, CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use stats::{RollingStats, StatsSnapshot};
