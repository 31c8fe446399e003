//! In-process event bus.
//!
//! Every state transition performed by the scheduler is published here as an
//! [`Event`]. Subscribers (the SSE endpoint, tests, internal observers) each get
//! their own bounded queue; a subscriber that falls behind loses the oldest
//! events instead of slowing the scheduler down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Task,
    Worker,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Job => write!(f, "job"),
            EntityType::Task => write!(f, "task"),
            EntityType::Worker => write!(f, "worker"),
        }
    }
}

/// A state-change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub new_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl ToString,
        new_state: impl ToString,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            new_state: new_state.to_string(),
            progress: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Fire-and-forget publish/subscribe channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        tracing::trace!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            new_state = %event.new_state,
            "Event published"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(Event::new(EntityType::Job, "j1", "queued"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::new(EntityType::Task, "t1", "assigned"));
        bus.publish(Event::new(EntityType::Task, "t1", "running").with_progress(0.0));
        bus.publish(Event::new(EntityType::Task, "t1", "completed").with_progress(1.0));

        assert_eq!(rx.recv().await.unwrap().new_state, "assigned");
        assert_eq!(rx.recv().await.unwrap().new_state, "running");
        let last = rx.recv().await.unwrap();
        assert_eq!(last.new_state, "completed");
        assert_eq!(last.progress, Some(1.0));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::new(EntityType::Job, format!("j{i}"), "queued"));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // The newest events survive.
        assert_eq!(rx.recv().await.unwrap().entity_id, "j3");
    }

    #[test]
    fn event_serializes_without_empty_fields() {
        let event = Event::new(EntityType::Worker, "w1", "offline");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["entity_type"], "worker");
        assert_eq!(json["new_state"], "offline");
        assert!(json.get("progress").is_none());
        assert!(json.get("message").is_none());
    }
}
