//! Event value type and the wire vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use apiary_db::models::EventRecord;

/// Well-known event types.
pub mod types {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_REVIEW_REQUESTED: &str = "task.review_requested";
    pub const TASK_REVIEW_COMPLETED: &str = "task.review_completed";
    pub const TASK_ESCALATED: &str = "task.escalated";

    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const AGENT_CAPACITY_CHANGED: &str = "agent.capacity_changed";

    pub const WORKFLOW_PLAN_GENERATED: &str = "workflow.plan_generated";
    pub const WORKFLOW_PHASE_STARTED: &str = "workflow.phase_started";
    pub const WORKFLOW_PHASE_COMPLETED: &str = "workflow.phase_completed";
    pub const WORKFLOW_DEPENDENCIES_RESOLVED: &str = "workflow.dependencies_resolved";
    pub const WORKFLOW_BLOCKED: &str = "workflow.blocked";
}

/// An event on the bus. The payload is an opaque JSON object; `task.*`
/// events conventionally carry `task_id`, `task_status`, `assignee`, and
/// `phase` at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source_agent: String,
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source_agent: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source_agent: source_agent.into(),
            correlation_id: None,
            payload,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// `task_id` from the payload, when present.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id")?.as_str()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key)?.as_str()
    }

    pub(crate) fn to_record(&self) -> EventRecord {
        EventRecord {
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            source_agent: self.source_agent.clone(),
            correlation_id: self.correlation_id.clone(),
            payload: sqlx::types::Json(self.payload.clone()),
            metadata: sqlx::types::Json(self.metadata.clone()),
            created_at: self.timestamp,
        }
    }
}

impl From<EventRecord> for Event {
    fn from(record: EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event_type: record.event_type,
            timestamp: record.timestamp,
            source_agent: record.source_agent,
            correlation_id: record.correlation_id,
            payload: record.payload.0,
            metadata: record.metadata.0,
        }
    }
}

/// Build a `task.*` event with the conventional payload shape and the
/// default `workflow_<task_id>` correlation id.
pub fn task_event(
    event_type: &str,
    task_id: &str,
    source_agent: &str,
    task_status: Option<&str>,
    assignee: Option<&str>,
    phase: Option<&str>,
) -> Event {
    let mut payload = serde_json::Map::new();
    payload.insert("task_id".into(), serde_json::Value::String(task_id.into()));
    if let Some(status) = task_status {
        payload.insert("task_status".into(), serde_json::Value::String(status.into()));
    }
    if let Some(assignee) = assignee {
        payload.insert("assignee".into(), serde_json::Value::String(assignee.into()));
    }
    if let Some(phase) = phase {
        payload.insert("phase".into(), serde_json::Value::String(phase.into()));
    }
    Event::new(event_type, source_agent, serde_json::Value::Object(payload))
        .with_correlation(format!("workflow_{task_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_event_defaults_correlation_to_workflow_id() {
        let event = task_event(types::TASK_STARTED, "t1", "queen", Some("in_progress"), None, Some("apply"));
        assert_eq!(event.correlation_id.as_deref(), Some("workflow_t1"));
        assert_eq!(event.task_id(), Some("t1"));
        assert_eq!(event.payload_str("phase"), Some("apply"));
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn record_roundtrip_preserves_fields() {
        let event = Event::new(types::AGENT_HEARTBEAT, "worker-1", serde_json::json!({"n": 1}))
            .with_correlation("c1");
        let back: Event = event.to_record().into();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.correlation_id.as_deref(), Some("c1"));
        assert_eq!(back.payload, event.payload);
    }
}
