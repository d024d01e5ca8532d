//! Per-provider circuit breaker.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::events::{Event, EventBus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Failures within `window` that open the circuit.
    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub window: Duration,
    /// First open period; later reopenings multiply it by `backoff_factor`.
    #[serde(with = "secs")]
    pub recovery_timeout: Duration,
    pub backoff_factor: f64,
    #[serde(with = "secs")]
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_recovery_timeout: Duration::from_secs(600),
        }
    }
}

impl CircuitConfig {
    fn open_duration(&self, reopen_count: u32) -> Duration {
        let scaled = self.recovery_timeout.as_secs_f64() * self.backoff_factor.powi(reopen_count as i32);
        Duration::from_secs_f64(scaled.min(self.max_recovery_timeout.as_secs_f64()))
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// How a call was admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial; its result decides the next state.
    Trial,
}

/// Reported state for diagnostics and routing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_eligible_retry: Option<DateTime<Utc>>,
    pub reopen_count: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    next_eligible: Option<Instant>,
    next_eligible_at: Option<DateTime<Utc>>,
    reopen_count: u32,
    trial_in_flight: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            last_failure_at: None,
            next_eligible: None,
            next_eligible_at: None,
            reopen_count: 0,
            trial_in_flight: false,
        }
    }
}

/// Closed / open / half-open state machine for one provider.
///
/// All state lives behind one mutex owned by this breaker, so unrelated
/// providers never contend.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call would currently be rejected, without claiming anything.
    pub fn is_rejecting(&self) -> Option<DateTime<Utc>> {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open => match inner.next_eligible {
                Some(at) if Instant::now() < at => inner.next_eligible_at,
                _ => None,
            },
            CircuitState::HalfOpen if inner.trial_in_flight => {
                Some(inner.next_eligible_at.unwrap_or_else(Utc::now))
            }
            CircuitState::HalfOpen => None,
        }
    }

    /// Admit a call or return the time after which another attempt may pass.
    ///
    /// An open circuit whose retry time has elapsed moves to half-open and
    /// admits exactly one trial; further calls are rejected until that trial
    /// reports back.
    pub fn try_acquire(&self) -> Result<Admission, DateTime<Utc>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_eligible {
                    Some(at) if now < at => Err(inner.next_eligible_at.unwrap_or_else(Utc::now)),
                    _ => {
                        self.transition(&mut inner, CircuitState::HalfOpen);
                        inner.trial_in_flight = true;
                        Ok(Admission::Trial)
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(inner.next_eligible_at.unwrap_or_else(Utc::now))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, _) => inner.failures.clear(),
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                inner.failures.clear();
                inner.reopen_count = 0;
                inner.next_eligible = None;
                inner.next_eligible_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            _ => {}
        }
    }

    /// Count one failure. Returns true when this failure opened the circuit.
    pub fn record_failure(&self, admission: Admission) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_failure_at = Some(Utc::now());

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                let window = self.config.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|&t| now.duration_since(t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                    true
                } else {
                    false
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                inner.reopen_count = inner.reopen_count.saturating_add(1);
                self.open(&mut inner, now);
                true
            }
            _ => false,
        }
    }

    /// Trial ended without a verdict on reachability (auth, quota, malformed, cancelled).
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Trial {
            let mut inner = self.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        *inner = Inner::new();
        if previous != CircuitState::Closed {
            self.announce(previous, CircuitState::Closed);
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures.len() as u32
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.failures.len() as u32,
            last_failure_at: inner.last_failure_at,
            next_eligible_retry: inner.next_eligible_at,
            reopen_count: inner.reopen_count,
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        let wait = self.config.open_duration(inner.reopen_count);
        inner.next_eligible = Some(now + wait);
        inner.next_eligible_at = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        inner.failures.clear();
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.announce(from, to);
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(provider = %self.provider, %from, "Circuit breaker opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(provider = %self.provider, "Circuit breaker half-open")
            }
            CircuitState::Closed => {
                tracing::info!(provider = %self.provider, "Circuit breaker closed")
            }
        }
        if let Some(events) = &self.events {
            events.publish(Event::circuit_transition(&self.provider, from, to));
        }
    }
}
