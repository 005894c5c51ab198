//! Lifecycle notifications.
//!
//! The dispatcher publishes typed events on a broadcast bus and does not
//! care whether anyone listens.

use crate::job::{Failure, JobId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Default event buffer per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Dispatcher and job lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatcherEvent {
    /// A dispatcher registered in a queue for the first time.
    DispatcherRegistered { dispatcher: Uuid, queue: String },
    /// A dispatcher activated.
    DispatcherActivated { dispatcher: Uuid, queues: Vec<String> },
    /// A dispatcher deactivated.
    DispatcherDeactivated { dispatcher: Uuid },
    /// A dispatcher missed its heartbeat and was declared dead.
    DispatcherDied {
        dispatcher: Uuid,
        queue: String,
        declared_by: Uuid,
        reclaimed: Vec<JobId>,
    },
    /// A worker started executing a job.
    JobStarted { job_id: JobId, queue: String, dispatcher: Uuid },
    /// A job completed successfully.
    JobSucceeded { job_id: JobId, queue: String, result: Value },
    /// A job completed with a failure.
    JobFailed { job_id: JobId, queue: String, failure: Failure },
}

impl DispatcherEvent {
    /// Event name.
    pub fn name(&self) -> &'static str {
        match self {
            DispatcherEvent::DispatcherRegistered { .. } => "dispatcher_registered",
            DispatcherEvent::DispatcherActivated { .. } => "dispatcher_activated",
            DispatcherEvent::DispatcherDeactivated { .. } => "dispatcher_deactivated",
            DispatcherEvent::DispatcherDied { .. } => "dispatcher_died",
            DispatcherEvent::JobStarted { .. } => "job_started",
            DispatcherEvent::JobSucceeded { .. } => "job_succeeded",
            DispatcherEvent::JobFailed { .. } => "job_failed",
        }
    }
}

/// Broadcast channel for [`DispatcherEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatcherEvent>,
}

impl EventBus {
    /// Creates a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; having no subscribers is fine.
    pub fn publish(&self, event: DispatcherEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = name, receivers = receivers, "Event published"),
            Err(_) => trace!(event = name, "Event dropped, no subscribers"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(DispatcherEvent::DispatcherDeactivated {
            dispatcher: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let dispatcher = Uuid::new_v4();

        bus.publish(DispatcherEvent::DispatcherActivated {
            dispatcher,
            queues: vec![String::new()],
        });

        let event = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(event.name(), "dispatcher_activated");
        assert!(matches!(
            event,
            DispatcherEvent::DispatcherActivated { dispatcher: d, .. } if d == dispatcher
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = DispatcherEvent::JobFailed {
            job_id: JobId::from("j1"),
            queue: String::new(),
            failure: Failure::type_error("bad operand"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "job_failed");
        assert_eq!(json["failure"]["kind"], "TypeError");
    }
}
