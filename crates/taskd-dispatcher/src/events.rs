//! Event publication for observers of task state.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

pub const TASK_CREATED: &str = "task.created";
pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_CHANGED: &str = "task.changed";
pub const TASK_PROGRESS: &str = "task.progress";
pub const TASK_INTERNAL_ERROR: &str = "task.internal_error";

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

/// Sink for task events.
pub trait EventBus: Send + Sync {
    fn publish(&self, name: &str, payload: Value);
}

/// Fan-out bus backed by a tokio broadcast channel. Publishing never blocks;
/// slow subscribers lose the oldest events.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, name: &str, payload: Value) {
        trace!(event = name, %payload, "Publishing event");
        // No subscribers is not an error.
        let _ = self.tx.send(Event {
            name: name.to_string(),
            payload,
        });
    }
}
