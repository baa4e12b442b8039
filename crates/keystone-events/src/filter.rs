//! Event filters used by subscriptions, `wait_for`, and replay.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::event::Event;

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Matches events by type, source, metadata equality, and an optional predicate.
///
/// Every configured criterion must match. An empty filter matches everything.
#[derive(Clone, Default)]
pub struct EventFilter {
    event_type: Option<String>,
    source: Option<String>,
    metadata: HashMap<String, Value>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires an exact event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Requires an exact source.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Requires a metadata key to equal the given value.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Requires an arbitrary predicate to hold.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Returns whether the event satisfies every criterion.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref event_type) = self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }

        if let Some(ref source) = self.source {
            if &event.source != source {
                return false;
            }
        }

        let metadata_ok = self
            .metadata
            .iter()
            .all(|(key, expected)| event.metadata.get(key) == Some(expected));
        if !metadata_ok {
            return false;
        }

        self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("event_type", &self.event_type)
            .field("source", &self.source)
            .field("metadata", &self.metadata)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Event {
        let mut metadata = HashMap::new();
        metadata.insert("tenant".to_string(), json!("acme"));
        Event::new("invoice:paid", "billing", json!({"amount": 120})).with_metadata(metadata)
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(EventFilter::new().matches(&sample()));
    }

    #[test]
    fn test_source_and_metadata() {
        let event = sample();
        assert!(
            EventFilter::new()
                .source("billing")
                .metadata("tenant", json!("acme"))
                .matches(&event)
        );
        assert!(!EventFilter::new().source("auth").matches(&event));
        assert!(
            !EventFilter::new()
                .metadata("tenant", json!("globex"))
                .matches(&event)
        );
        assert!(
            !EventFilter::new()
                .metadata("region", json!("eu"))
                .matches(&event)
        );
    }

    #[test]
    fn test_predicate() {
        let event = sample();
        let big = EventFilter::new().predicate(|e| e.payload["amount"].as_i64() > Some(100));
        let huge = EventFilter::new().predicate(|e| e.payload["amount"].as_i64() > Some(1000));
        assert!(big.matches(&event));
        assert!(!huge.matches(&event));
    }

    #[test]
    fn test_event_type() {
        let event = sample();
        assert!(EventFilter::new().event_type("invoice:paid").matches(&event));
        assert!(!EventFilter::new().event_type("invoice:void").matches(&event));
    }
}
