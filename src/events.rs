//! Engine event bus.
//!
//! Run completions, circuit-breaker transitions and schedule skips are
//! broadcast to any number of subscribers. Slow subscribers lose the oldest
//! events rather than stalling the engine.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::client::CircuitState;
use crate::types::RunStatus;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCompleted,
    CircuitTransition,
    ScheduleSkipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventStatus {
    Run { status: RunStatus, score: f64 },
    Circuit { from: CircuitState, to: CircuitState },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub status: EventStatus,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn run_completed(
        provider: impl Into<String>,
        model: impl Into<String>,
        run_id: Uuid,
        status: RunStatus,
        score: f64,
    ) -> Self {
        Self {
            kind: EventKind::RunCompleted,
            provider: provider.into(),
            model: Some(model.into()),
            run_id: Some(run_id),
            status: EventStatus::Run { status, score },
            at: Utc::now(),
        }
    }

    pub fn circuit_transition(
        provider: impl Into<String>,
        from: CircuitState,
        to: CircuitState,
    ) -> Self {
        Self {
            kind: EventKind::CircuitTransition,
            provider: provider.into(),
            model: None,
            run_id: None,
            status: EventStatus::Circuit { from, to },
            at: Utc::now(),
        }
    }

    pub fn schedule_skipped(
        provider: impl Into<String>,
        model: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::ScheduleSkipped,
            provider: provider.into(),
            model: Some(model.into()),
            run_id: None,
            status: EventStatus::Skipped {
                reason: reason.into(),
            },
            at: Utc::now(),
        }
    }
}

/// Broadcast channel shared by every engine component.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events of one kind, from the moment of subscription.
    pub fn subscribe(&self, kind: EventKind) -> impl Stream<Item = Event> + Send + 'static {
        filtered(self.sender.subscribe(), Some(kind))
    }

    pub fn subscribe_all(&self) -> impl Stream<Item = Event> + Send + 'static {
        filtered(self.sender.subscribe(), None)
    }
}

fn filtered(
    receiver: broadcast::Receiver<Event>,
    kind: Option<EventKind>,
) -> impl Stream<Item = Event> + Send + 'static {
    futures::stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) if kind.is_none_or(|k| k == event.kind) => {
                    return Some((event, receiver));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, dropping oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_subscribe_filters_by_kind() {
        let bus = EventBus::default();
        let mut runs = Box::pin(bus.subscribe(EventKind::RunCompleted));

        bus.publish(Event::circuit_transition(
            "openai",
            CircuitState::Closed,
            CircuitState::Open,
        ));
        let run_id = Uuid::new_v4();
        bus.publish(Event::run_completed(
            "openai",
            "gpt-4o",
            run_id,
            RunStatus::Succeeded,
            0.8,
        ));

        let event = runs.next().await.unwrap();
        assert_eq!(event.kind, EventKind::RunCompleted);
        assert_eq!(event.run_id, Some(run_id));
    }

    #[tokio::test]
    async fn test_subscribe_all_sees_everything() {
        let bus = EventBus::default();
        let mut all = Box::pin(bus.subscribe_all());
        bus.publish(Event::schedule_skipped("a", "m", "previous run in progress"));
        bus.publish(Event::circuit_transition(
            "a",
            CircuitState::Open,
            CircuitState::HalfOpen,
        ));

        assert_eq!(all.next().await.unwrap().kind, EventKind::ScheduleSkipped);
        assert_eq!(all.next().await.unwrap().kind, EventKind::CircuitTransition);
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::default();
        let mut stream = Box::pin(bus.subscribe_all());
        drop(bus);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(Event::schedule_skipped("a", "m", "busy"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
