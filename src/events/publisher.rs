use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::events;
use crate::state_machine::{RunStatus, TaskStatus};

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// Broadcast publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event with the given name and context.
    ///
    /// A broadcast send with no subscribers errors; that is acceptable here,
    /// the event is simply dropped.
    pub fn publish(&self, name: impl Into<String>, context: Value) {
        let event = PublishedEvent {
            name: name.into(),
            context,
            published_at: chrono::Utc::now(),
        };
        let _ = self.sender.send(event);
    }

    pub fn run_started(&self, run_id: Uuid) {
        self.publish(events::RUN_STARTED, json!({ "run_id": run_id }));
    }

    pub fn run_finished(&self, run_id: Uuid, status: RunStatus, reason: Option<&str>) {
        self.publish(
            events::RUN_FINISHED,
            json!({ "run_id": run_id, "status": status, "reason": reason }),
        );
    }

    pub fn task_transition(&self, run_id: Uuid, task_id: Uuid, alias: &str, status: TaskStatus) {
        self.publish(
            events::TASK_TRANSITION,
            json!({ "run_id": run_id, "task_id": task_id, "alias": alias, "status": status }),
        );
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();
        publisher.run_started(Uuid::new_v4());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, events::RUN_STARTED);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let publisher = EventPublisher::new(16);
        publisher.run_started(Uuid::new_v4());
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
