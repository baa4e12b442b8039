//! The immutable event envelope carried by the bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Version of the persisted event layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Free-form metadata attached to an event.
pub type EventMetadata = HashMap<String, Value>;

/// An event published on the bus.
///
/// Created once by [`crate::EventBus::publish`] and never mutated
/// afterwards; handlers receive shared references or clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: Uuid,
    /// Event type, e.g. `"user:registered"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Component or plugin that published the event.
    pub source: String,
    /// Event body.
    pub payload: Value,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Layout version of this event.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl Event {
    /// Create a new event stamped with a fresh ID and the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            payload,
            metadata: EventMetadata::new(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Gets a metadata value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_type_field() {
        let event = Event::new("user:registered", "auth", json!({"id": 42}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user:registered");
        assert_eq!(value["schema_version"], 1);
    }

    #[test]
    fn test_missing_schema_version_defaults() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "type": "order:placed",
            "source": "shop",
            "payload": {},
            "timestamp": Utc::now(),
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(event.schema_version, SCHEMA_VERSION);
        assert!(event.metadata.is_empty());
    }
}
