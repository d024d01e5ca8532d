//! Recurring verification.
//!
//! Each [`Schedule`] pairs a [`Cadence`] with a [`TargetSelector`]. A
//! background loop wakes every tick, fires the schedules that are due and
//! computes the next fire time from the schedule's anchor, so slow runs never
//! push later fires back. A target whose previous run is still in progress is
//! skipped for that tick, never queued.

mod cron;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::cron::CronSchedule;
use crate::events::Event;
use crate::types::duration_ms;
use crate::verifier::Orchestrator;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Interval must be positive")]
    ZeroInterval,

    #[error("Schedule '{0}' is already registered")]
    Duplicate(String),

    #[error("Schedule '{0}' not found")]
    NotFound(String),

    #[error("Verification of {provider}/{model} already in progress")]
    TargetBusy { provider: String, model: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Fires at `anchor + N * every`; the anchor defaults to registration time.
    Interval {
        #[serde(rename = "every_ms", with = "duration_ms")]
        every: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<DateTime<Utc>>,
    },
    /// Five-field cron expression evaluated in UTC.
    Cron(String),
}

impl Cadence {
    pub fn every(every: Duration) -> Self {
        Cadence::Interval {
            every,
            anchor: None,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Cadence::Cron(expression.into())
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Cadence::Interval { every, .. } if every.is_zero() => Err(ScheduleError::ZeroInterval),
            Cadence::Interval { .. } => Ok(()),
            Cadence::Cron(expression) => CronSchedule::parse(expression).map(|_| ()),
        }
    }
}

/// Which (provider, model) pairs a schedule covers.
///
/// Empty `providers` selects every enabled provider; empty `models` selects
/// every model in each provider's catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSelector {
    pub providers: Vec<String>,
    pub models: Vec<String>,
}

impl TargetSelector {
    pub fn target(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            providers: vec![provider.into()],
            models: vec![model.into()],
        }
    }

    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            providers: vec![provider.into()],
            models: Vec::new(),
        }
    }

    async fn resolve(&self, orchestrator: &Orchestrator) -> Vec<(String, String)> {
        let registry = orchestrator.dispatcher().registry();
        let providers = if self.providers.is_empty() {
            registry.enabled_names()
        } else {
            self.providers
                .iter()
                .filter(|p| registry.is_enabled(p))
                .cloned()
                .collect()
        };

        let mut targets = Vec::new();
        for provider in providers {
            if self.models.is_empty() {
                for record in orchestrator.catalog().models(&provider).await {
                    targets.push((provider.clone(), record.model_id));
                }
            } else {
                for model in &self.models {
                    targets.push((provider.clone(), model.clone()));
                }
            }
        }
        targets
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub cadence: Cadence,
    #[serde(default)]
    pub targets: TargetSelector,
}

impl Schedule {
    pub fn new(name: impl Into<String>, cadence: Cadence, targets: TargetSelector) -> Self {
        Self {
            name: name.into(),
            cadence,
            targets,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    #[serde(rename = "tick_ms", with = "duration_ms")]
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Latest known state of one (provider, model) target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub provider: String,
    pub model: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Entry {
    schedule: Schedule,
    cron: Option<CronSchedule>,
    anchor: Instant,
    next_fire: Instant,
    last_fired: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(schedule: Schedule, now: Instant) -> Result<Self, ScheduleError> {
        schedule.cadence.validate()?;
        let (cron, anchor) = match &schedule.cadence {
            Cadence::Cron(expression) => (Some(CronSchedule::parse(expression)?), now),
            Cadence::Interval { anchor, .. } => (None, anchor.map_or(now, |a| to_instant(a, now))),
        };
        let mut entry = Self {
            schedule,
            cron,
            anchor,
            next_fire: now,
            last_fired: None,
        };
        entry.next_fire = entry.next_after(now).unwrap_or(now);
        Ok(entry)
    }

    /// Next fire strictly after `now`, derived from the anchor.
    fn next_after(&self, now: Instant) -> Option<Instant> {
        match (&self.schedule.cadence, &self.cron) {
            (Cadence::Interval { every, .. }, _) => Some(next_interval_fire(self.anchor, *every, now)),
            (Cadence::Cron(_), Some(cron)) => {
                let wall = Utc::now() + chrono::Duration::from_std(now.saturating_duration_since(Instant::now())).ok()?;
                cron.next_after(wall).map(|at| to_instant(at, Instant::now()))
            }
            (Cadence::Cron(_), None) => None,
        }
    }
}

/// Smallest `anchor + N * every` strictly after `now` (N >= 1 once the anchor has passed).
pub(crate) fn next_interval_fire(anchor: Instant, every: Duration, now: Instant) -> Instant {
    if now < anchor {
        return anchor;
    }
    let every_ns = every.as_nanos().max(1);
    let periods = (now - anchor).as_nanos() / every_ns + 1;
    let offset = every_ns.saturating_mul(periods);
    anchor + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
}

/// Map a wall-clock instant onto the monotonic clock relative to `now`.
fn to_instant(at: DateTime<Utc>, now: Instant) -> Instant {
    let delta = at - Utc::now();
    match delta.to_std() {
        Ok(ahead) => now + ahead,
        Err(_) => {
            let behind = (-delta).to_std().unwrap_or_default();
            now.checked_sub(behind).unwrap_or(now)
        }
    }
}

type TargetKey = (String, String);

/// Marks a target as running until dropped.
#[derive(Debug)]
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    orchestrator: Orchestrator,
    config: SchedulerConfig,
    entries: Arc<Mutex<Vec<Entry>>>,
    running: Arc<DashMap<TargetKey, Arc<AtomicBool>>>,
    status: Arc<DashMap<TargetKey, TargetStatus>>,
    cancel: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            entries: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(DashMap::new()),
            status: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, schedule: Schedule) -> Result<(), ScheduleError> {
        let mut entries = self.entries();
        if entries.iter().any(|e| e.schedule.name == schedule.name) {
            return Err(ScheduleError::Duplicate(schedule.name));
        }
        let entry = Entry::new(schedule, Instant::now())?;
        tracing::info!(schedule = %entry.schedule.name, "Schedule registered");
        entries.push(entry);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), ScheduleError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.schedule.name != name);
        if entries.len() == before {
            return Err(ScheduleError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Replace every schedule. Nothing changes unless all of them are valid.
    ///
    /// Schedules whose name and cadence are unchanged keep their anchor.
    pub fn reload(&self, schedules: Vec<Schedule>) -> Result<(), ScheduleError> {
        let now = Instant::now();
        let mut entries = self.entries();
        let mut next = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            if next.iter().any(|e: &Entry| e.schedule.name == schedule.name) {
                return Err(ScheduleError::Duplicate(schedule.name));
            }
            let kept = entries
                .iter()
                .position(|e| e.schedule.name == schedule.name && e.schedule.cadence == schedule.cadence);
            let entry = match kept {
                Some(i) => {
                    let mut entry = entries.swap_remove(i);
                    entry.schedule = schedule;
                    entry
                }
                None => Entry::new(schedule, now)?,
            };
            next.push(entry);
        }
        *entries = next;
        tracing::info!(schedules = entries.len(), "Schedules reloaded");
        Ok(())
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.entries().iter().map(|e| e.schedule.clone()).collect()
    }

    /// Wall-clock estimate of the schedule's next fire.
    pub fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries();
        let entry = entries.iter().find(|e| e.schedule.name == name)?;
        let ahead = entry.next_fire.saturating_duration_since(Instant::now());
        Some(Utc::now() + chrono::Duration::from_std(ahead).ok()?)
    }

    pub fn last_fired(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries()
            .iter()
            .find(|e| e.schedule.name == name)
            .and_then(|e| e.last_fired)
    }

    pub fn status(&self, provider: &str, model: &str) -> Option<TargetStatus> {
        self.status
            .get(&(provider.to_string(), model.to_string()))
            .map(|s| s.clone())
    }

    pub fn statuses(&self) -> Vec<TargetStatus> {
        let mut all: Vec<_> = self.status.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        all
    }

    pub fn is_running(&self, provider: &str, model: &str) -> bool {
        self.running
            .get(&(provider.to_string(), model.to_string()))
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// Claim the target for one run; `None` while another run holds it.
    pub fn try_claim(&self, provider: &str, model: &str) -> Option<RunGuard> {
        let flag = self
            .running
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { flag })
    }

    /// Start the background tick loop. Calling again while running is a no-op.
    pub fn start(&self) {
        if !self.config.enabled {
            tracing::debug!("Scheduler disabled");
            return;
        }
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let scheduler = self.clone();
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                scheduler.tick().await;
            }
            tracing::debug!("Scheduler loop stopped");
        }));
    }

    /// Stop the loop and cancel runs it started.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Dispatch every due schedule once; returns the number dispatched.
    ///
    /// Each schedule resolves its targets on its own task.
    pub async fn tick(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Schedule> = {
            let mut entries = self.entries();
            let mut due = Vec::new();
            for entry in entries.iter_mut().filter(|e| e.next_fire <= now) {
                due.push(entry.schedule.clone());
                entry.last_fired = Some(Utc::now());
                match entry.next_after(now) {
                    Some(next) => entry.next_fire = next,
                    None => {
                        tracing::warn!(schedule = %entry.schedule.name, "Schedule has no future fire time");
                        entry.next_fire = now + Duration::from_secs(86_400 * 365);
                    }
                }
            }
            due
        };

        let dispatched = due.len();
        for schedule in due {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let targets = tokio::select! {
                    _ = scheduler.cancel.cancelled() => return,
                    targets = schedule.targets.resolve(&scheduler.orchestrator) => targets,
                };
                let started = targets
                    .into_iter()
                    .filter(|(provider, model)| {
                        scheduler.fire(&schedule.name, provider.clone(), model.clone())
                    })
                    .count();
                tracing::debug!(schedule = %schedule.name, started, "Schedule dispatched");
            });
        }
        dispatched
    }

    fn fire(&self, schedule: &str, provider: String, model: String) -> bool {
        let metrics = self.orchestrator.dispatcher().metrics().clone();
        let Some(guard) = self.try_claim(&provider, &model) else {
            tracing::info!(
                schedule,
                provider = %provider,
                model = %model,
                "Previous run still in progress, skipping tick"
            );
            metrics.schedule_skips.inc();
            self.orchestrator
                .dispatcher()
                .events()
                .publish(Event::schedule_skipped(
                    &provider,
                    &model,
                    "previous run in progress",
                ));
            return false;
        };

        metrics.schedule_fires.inc();
        let run_id = Uuid::new_v4();
        let key = (provider.clone(), model.clone());
        self.status.insert(
            key.clone(),
            TargetStatus {
                provider: provider.clone(),
                model: model.clone(),
                state: JobState::Running,
                last_run_id: Some(run_id),
                last_fired: Some(Utc::now()),
                last_error: None,
            },
        );

        let orchestrator = self.orchestrator.clone();
        let status = self.status.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let _guard = guard;
            let result = orchestrator
                .verify_as(run_id, &provider, &model, cancel)
                .await;
            if let Some(mut entry) = status.get_mut(&key) {
                match result {
                    Ok(run) => {
                        entry.state = JobState::Completed;
                        entry.last_run_id = Some(run.run_id);
                        entry.last_error = None;
                    }
                    Err(e) => {
                        entry.state = JobState::Failed;
                        entry.last_error = Some(e.to_string());
                    }
                }
            }
        });
        true
    }

    /// Record a manually triggered run in the target status table.
    pub(crate) fn mark(&self, provider: &str, model: &str, state: JobState, run_id: Uuid, error: Option<String>) {
        let key = (provider.to_string(), model.to_string());
        let mut entry = self.status.entry(key).or_insert_with(|| TargetStatus {
            provider: provider.to_string(),
            model: model.to_string(),
            state: JobState::Pending,
            last_run_id: None,
            last_fired: None,
            last_error: None,
        });
        entry.state = state;
        entry.last_run_id = Some(run_id);
        entry.last_error = error;
    }
}
