//! Event envelope exchanged over the stream.
//!
//! Events travel as JSON with camelCase field names:
//!
//! ```json
//! {
//!   "header": { "eventId": "…", "sourceInstanceId": "…" },
//!   "body": { "type": "ref-updated", "eventCreatedOn": 1700000000, "…": "…" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::bus::Result;

/// Identity of one published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub event_id: Uuid,
    /// Instance that produced the event. Used as the partition key by
    /// `BrokerApi::send`.
    pub source_instance_id: Uuid,
}

/// Host event body.
///
/// Only `type` is interpreted; every other field is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Creation time in seconds since the epoch.
    #[serde(default)]
    pub event_created_on: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            instance_id: None,
            event_created_on: chrono::Utc::now().timestamp(),
            fields: Map::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Header plus body, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub header: EventHeader,
    pub body: Event,
}

impl EventMessage {
    /// Wrap `body` with a fresh event id.
    pub fn new(source_instance_id: Uuid, body: Event) -> Self {
        Self {
            header: EventHeader {
                event_id: Uuid::new_v4(),
                source_instance_id,
            },
            body,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;

    #[test]
    fn test_header_uses_camel_case() {
        let message = EventMessage::new(Uuid::new_v4(), Event::new("ref-updated"));
        let json: Value = serde_json::from_slice(&message.to_json_bytes().unwrap()).unwrap();

        assert_eq!(
            json["header"]["eventId"],
            Value::String(message.header.event_id.to_string())
        );
        assert_eq!(
            json["header"]["sourceInstanceId"],
            Value::String(message.header.source_instance_id.to_string())
        );
        assert_eq!(json["body"]["type"], "ref-updated");
        assert!(json["body"].get("instanceId").is_none());
    }

    #[test]
    fn test_extra_body_fields_are_preserved() {
        let raw = br#"{
            "header": {
                "eventId": "3f0c1e0e-4a43-4b0c-9d2a-0f3c0c3b1a11",
                "sourceInstanceId": "8c1f0b6a-2b6f-4e0e-8d0e-6d2a6f1b9c22"
            },
            "body": {
                "type": "patchset-created",
                "instanceId": "gerrit-1",
                "eventCreatedOn": 1700000000,
                "project": "demo",
                "change": { "number": 42 }
            }
        }"#;

        let message = EventMessage::from_json_bytes(raw).unwrap();
        assert_eq!(message.body.event_type, "patchset-created");
        assert_eq!(message.body.instance_id.as_deref(), Some("gerrit-1"));
        assert_eq!(message.body.event_created_on, 1_700_000_000);
        assert_eq!(message.body.fields["project"], "demo");
        assert_eq!(message.body.fields["change"]["number"], 42);

        let again: Value = serde_json::from_slice(&message.to_json_bytes().unwrap()).unwrap();
        assert_eq!(again["body"]["change"]["number"], 42);
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = EventMessage::from_json_bytes(b"not json").unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn test_builder_helpers() {
        let event = Event::new("comment-added")
            .with_instance_id("node-a")
            .with_field("author", "jane");
        assert_eq!(event.instance_id.as_deref(), Some("node-a"));
        assert_eq!(event.fields["author"], "jane");
        assert!(event.event_created_on > 0);
    }
}
