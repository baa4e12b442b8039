//! Event bus delivery statistics.
//!
//! Counters are atomics and per-key maps use `DashMap`, so publishers and
//! the drain loop update them without contending on a single lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    /// Events published.
    pub total_events: u64,
    /// Events published per type.
    pub events_by_type: HashMap<String, u64>,
    /// Events published per source.
    pub events_by_source: HashMap<String, u64>,
    /// Handler deliveries that failed after every retry.
    pub failed_events: u64,
    /// Events taken off the queue and dispatched.
    pub processed_events: u64,
    /// Running average dispatch time per event, in milliseconds.
    pub average_processing_ms: f64,
}

/// Thread-safe statistics collector.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    total: AtomicU64,
    by_type: DashMap<String, u64>,
    by_source: DashMap<String, u64>,
    failed: AtomicU64,
    /// (processed count, average ms)
    processing: Mutex<(u64, f64)>,
}

impl StatsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a publish.
    pub(crate) fn record_published(&self, event: &Event) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_type.entry(event.event_type.clone()).or_insert(0) += 1;
        *self.by_source.entry(event.source.clone()).or_insert(0) += 1;
    }

    /// Record a delivery that exhausted its retries.
    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dispatched event and fold its duration into the running average.
    pub(crate) fn record_processed(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if let Ok(mut processing) = self.processing.lock() {
            let (count, average) = *processing;
            let count = count + 1;
            *processing = (count, average + (ms - average) / count as f64);
        }
    }

    pub(crate) fn snapshot(&self) -> EventStats {
        let (processed_events, average_processing_ms) = self
            .processing
            .lock()
            .map(|p| *p)
            .unwrap_or_default();

        EventStats {
            total_events: self.total.load(Ordering::Relaxed),
            events_by_type: self
                .by_type
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            events_by_source: self
                .by_source
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            failed_events: self.failed.load(Ordering::Relaxed),
            processed_events,
            average_processing_ms,
        }
    }

    pub(crate) fn clear(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.by_type.clear();
        self.by_source.clear();
        self.failed.store(0, Ordering::Relaxed);
        if let Ok(mut processing) = self.processing.lock() {
            *processing = (0, 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counts_by_type_and_source() {
        let stats = StatsCollector::new();
        stats.record_published(&Event::new("a", "x", json!(null)));
        stats.record_published(&Event::new("a", "y", json!(null)));
        stats.record_published(&Event::new("b", "x", json!(null)));

        let snap = stats.snapshot();
        assert_eq!(snap.total_events, 3);
        assert_eq!(snap.events_by_type["a"], 2);
        assert_eq!(snap.events_by_source["x"], 2);
    }

    #[test]
    fn test_running_average() {
        let stats = StatsCollector::new();
        stats.record_processed(Duration::from_millis(10));
        stats.record_processed(Duration::from_millis(30));

        let snap = stats.snapshot();
        assert_eq!(snap.processed_events, 2);
        assert!((snap.average_processing_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_clear() {
        let stats = StatsCollector::new();
        stats.record_published(&Event::new("a", "x", json!(null)));
        stats.record_failure();
        stats.clear();
        assert_eq!(stats.snapshot(), EventStats::default());
    }
}
