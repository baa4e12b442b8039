//! Durable event log.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::error::{AppError, ErrorKind};
use keystone_core::result::AppResult;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::event::Event;
use crate::filter::EventFilter;

/// Append-only storage for published events.
#[async_trait]
pub trait EventStore: Send + Sync + Debug {
    /// Appends one event to the log.
    async fn append(&self, event: &Event) -> AppResult<()>;

    /// Returns events with `since <= timestamp` (and `timestamp <= until`
    /// when given) that match the filter, in ascending timestamp order.
    async fn query(
        &self,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        filter: Option<&EventFilter>,
    ) -> AppResult<Vec<Event>>;

    /// Number of stored events.
    async fn count(&self) -> AppResult<usize>;
}

fn select(
    events: impl Iterator<Item = Event>,
    since: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
    filter: Option<&EventFilter>,
) -> Vec<Event> {
    let mut selected: Vec<Event> = events
        .filter(|e| e.timestamp >= since)
        .filter(|e| until.is_none_or(|u| e.timestamp <= u))
        .filter(|e| filter.is_none_or(|f| f.matches(e)))
        .collect();
    // Stable: events sharing a timestamp keep log order.
    selected.sort_by_key(|e| e.timestamp);
    selected
}

/// In-memory event log.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventStore {
    /// Creates an empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &Event) -> AppResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query(
        &self,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        filter: Option<&EventFilter>,
    ) -> AppResult<Vec<Event>> {
        let events = self.events.read().await;
        Ok(select(events.iter().cloned(), since, until, filter))
    }

    async fn count(&self) -> AppResult<usize> {
        Ok(self.events.read().await.len())
    }
}

/// Event log stored as JSON lines, one event per line.
#[derive(Debug)]
pub struct FileEventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventStore {
    /// Opens (or lazily creates) a log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> AppResult<Vec<Event>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AppError::with_source(
                    ErrorKind::Storage,
                    format!("Failed to read event log {}", self.path.display()),
                    e,
                ));
            }
        };

        let mut events = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed event log line"
                    );
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, event: &Event) -> AppResult<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(
        &self,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        filter: Option<&EventFilter>,
    ) -> AppResult<Vec<Event>> {
        let events = self.read_all().await?;
        Ok(select(events.into_iter(), since, until, filter))
    }

    async fn count(&self) -> AppResult<usize> {
        Ok(self.read_all().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_query_orders_by_timestamp() {
        let store = MemoryEventStore::new();
        let base = Utc::now();
        store
            .append(&Event::new("b", "s", json!(2)).at(base + Duration::seconds(2)))
            .await
            .unwrap();
        store
            .append(&Event::new("a", "s", json!(1)).at(base + Duration::seconds(1)))
            .await
            .unwrap();
        store
            .append(&Event::new("old", "s", json!(0)).at(base - Duration::hours(1)))
            .await
            .unwrap();

        let events = store.query(base, None, None).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["a", "b"]);

        let bounded = store
            .query(base, Some(base + Duration::seconds(1)), None)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path().join("nested").join("events.jsonl"));
        let since = Utc::now() - Duration::minutes(1);

        store
            .append(&Event::new("order:placed", "shop", json!({"id": 1})))
            .await
            .unwrap();
        store
            .append(&Event::new("order:placed", "pos", json!({"id": 2})))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        let filter = EventFilter::new().source("pos");
        let events = store.query(since, None, Some(&filter)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["id"], 2);
    }

    #[tokio::test]
    async fn test_file_store_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let event = Event::new("a", "s", json!(null));
        let content = format!("not json\n{}\n\n", serde_json::to_string(&event).unwrap());
        tokio::fs::write(&path, content).await.unwrap();

        let store = FileEventStore::new(&path);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path().join("absent.jsonl"));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
