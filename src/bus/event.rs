//! Immutable events carried by the bus.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// A published event.
///
/// Events are shared between subscribers as `Arc<Event>` and never mutated
/// after publication.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    /// Wall-clock publication time.
    pub timestamp: DateTime<Utc>,
    /// Monotonic publication time, for latency measurement.
    pub published_at: Instant,
    /// Pairs requests and responses across async boundaries.
    pub correlation_id: Option<Uuid>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            published_at: Instant::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Read a string field from an object payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Well-known topic names.
pub mod topics {
    pub const HANDLER_ERROR: &str = "bus.handler_error";

    pub const COMPONENT_READY: &str = "component.ready";

    pub const MODEL_DISCOVERED: &str = "model.discovered";
    pub const MODEL_LOADING: &str = "model.loading";
    pub const MODEL_READY: &str = "model.ready";
    pub const MODEL_FAILED: &str = "model.failed";
    pub const MODEL_SWAPPED: &str = "model.swapped";
    pub const MODEL_UNLOADED: &str = "model.unloaded";
    pub const MODEL_REMOVED: &str = "model.removed";
    pub const MODEL_INFER: &str = "model.infer";
    pub const MODEL_ERROR: &str = "model.error";

    pub const INTERACTION_RECEIVED: &str = "interaction.received";
    pub const INTERACTION_COMPLETED: &str = "interaction.completed";
    pub const INTERACTION_FAILED: &str = "interaction.failed";

    pub const TASK_DUE: &str = "task.due";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";

    pub const MEMORY_PERSISTENCE_FAILED: &str = "memory.persistence_failed";
    pub const MEMORY_PRUNED: &str = "memory.pruned";

    pub const ORCHESTRATOR_STARTED: &str = "orchestrator.started";
    pub const ORCHESTRATOR_STOPPED: &str = "orchestrator.stopped";
    pub const ORCHESTRATOR_DEGRADED: &str = "orchestrator.degraded";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_str_field() {
        let event = Event::new("t", json!({"model_id": "phi", "n": 3}));
        assert_eq!(event.str_field("model_id"), Some("phi"));
        assert_eq!(event.str_field("n"), None);
        assert_eq!(event.str_field("missing"), None);
    }

    #[test]
    fn test_with_correlation() {
        let cid = Uuid::new_v4();
        let event = Event::new("t", Value::Null).with_correlation(cid);
        assert_eq!(event.correlation_id, Some(cid));
    }
}
