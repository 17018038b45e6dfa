//! Event types: inbound cloud events and engine lifecycle notifications.
//!
//! `EventEnvelope` is what the correlation engine ingests. `EngineEvent` is
//! broadcast on the engine event bus whenever an instance, task or
//! correlation changes state. All variants are Clone + Send + Sync for use
//! with tokio broadcast channels.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::instance::{TaskInstanceStatus, WorkflowInstanceStatus};

/// An inbound event, shaped after the CloudEvents attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Extension attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_attributes: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// New event stamped with the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            time: Utc::now(),
            subject: None,
            data,
            context_attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_attributes.insert(name.into(), value.into());
        self
    }

    /// Flat attribute document used for filter matching and expressions.
    ///
    /// Shape: `{ "id", "type", "source", "time", "subject"?, "data", <extensions>... }`.
    /// Core attributes win over extensions of the same name.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        for (name, value) in &self.context_attributes {
            doc.insert(name.clone(), Value::String(value.clone()));
        }
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        doc.insert("type".to_string(), Value::String(self.event_type.clone()));
        doc.insert("source".to_string(), Value::String(self.source.clone()));
        doc.insert("time".to_string(), Value::String(self.time.to_rfc3339()));
        if let Some(subject) = &self.subject {
            doc.insert("subject".to_string(), Value::String(subject.clone()));
        }
        doc.insert("data".to_string(), self.data.clone());
        Value::Object(doc)
    }
}

/// Lifecycle notifications published by the engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow instance was created.
    InstanceCreated {
        instance_id: Uuid,
        definition: String,
    },

    /// A workflow instance changed status.
    InstanceStatusChanged {
        instance_id: Uuid,
        from: WorkflowInstanceStatus,
        to: WorkflowInstanceStatus,
    },

    /// A task instance changed status.
    TaskStatusChanged {
        instance_id: Uuid,
        task_id: Uuid,
        reference: String,
        from: TaskInstanceStatus,
        to: TaskInstanceStatus,
    },

    /// A correlation context completed and its outcome was dispatched.
    CorrelationCompleted {
        correlation_id: Uuid,
        context_id: Uuid,
    },

    /// A correlation rule was removed after its single use.
    CorrelationDeleted { correlation_id: Uuid },
}

impl EngineEvent {
    /// The workflow instance the event is about, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::InstanceCreated { instance_id, .. }
            | EngineEvent::InstanceStatusChanged { instance_id, .. }
            | EngineEvent::TaskStatusChanged { instance_id, .. } => Some(*instance_id),
            EngineEvent::CorrelationCompleted { .. } | EngineEvent::CorrelationDeleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_document_shape() {
        let event = EventEnvelope::new("order.paid", "/payments", json!({ "orderId": 7 }))
            .with_attribute("tenant", "acme")
            .with_attribute("type", "shadowed");
        let doc = event.to_document();
        assert_eq!(doc["type"], json!("order.paid"));
        assert_eq!(doc["source"], json!("/payments"));
        assert_eq!(doc["tenant"], json!("acme"));
        assert_eq!(doc["data"]["orderId"], json!(7));
        assert!(doc.get("subject").is_none());
    }

    #[test]
    fn test_event_envelope_serde() {
        let event = EventEnvelope::new("a", "b", Value::Null);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"a\""));
        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_engine_event_serde() {
        let event = EngineEvent::InstanceStatusChanged {
            instance_id: Uuid::now_v7(),
            from: WorkflowInstanceStatus::Pending,
            to: WorkflowInstanceStatus::Running,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"instance_status_changed\""));
        assert!(json.contains("\"to\":\"running\""));
    }
}
