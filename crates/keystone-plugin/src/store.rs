//! Persisted plugin records.
//!
//! The [`crate::PluginManager`] is the only writer.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::error::{AppError, ErrorKind};
use keystone_core::result::AppResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::manifest::PluginManifest;

/// Persisted status of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Installed, never enabled or reinstalled.
    Installed,
    /// Enabled; re-enabled on restore.
    Enabled,
    /// Disabled by an operator.
    Disabled,
    /// The last enable attempt failed.
    Error,
    /// Uninstalled.
    Removed,
}

impl PluginStatus {
    /// Returns the string name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted plugin record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Plugin identifier (unique).
    pub id: String,
    /// Installed version.
    pub version: String,
    /// Description from the manifest.
    pub description: String,
    /// Author from the manifest.
    pub author: String,
    /// Lifecycle status.
    pub status: PluginStatus,
    /// Stored configuration (overrides manifest defaults).
    pub config: Value,
    /// Required permissions.
    pub permissions: Vec<String>,
    /// The installed manifest, including routes and hooks.
    pub manifest: PluginManifest,
    /// First install time.
    pub installed_at: DateTime<Utc>,
    /// Last successful enable.
    pub enabled_at: Option<DateTime<Utc>>,
    /// Last disable.
    pub disabled_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl PluginRecord {
    /// A fresh `installed` record for `manifest`.
    pub fn new(manifest: &PluginManifest, now: DateTime<Utc>) -> Self {
        Self {
            id: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            status: PluginStatus::Installed,
            config: Value::Object(serde_json::Map::new()),
            permissions: manifest.permissions.clone(),
            manifest: manifest.clone(),
            installed_at: now,
            enabled_at: None,
            disabled_at: None,
            updated_at: now,
        }
    }

    /// Replace manifest-derived fields in place, keeping config and timestamps.
    pub fn apply_manifest(&mut self, manifest: &PluginManifest, now: DateTime<Utc>) {
        self.version = manifest.version.clone();
        self.description = manifest.description.clone();
        self.author = manifest.author.clone();
        self.permissions = manifest.permissions.clone();
        self.manifest = manifest.clone();
        self.updated_at = now;
    }

    fn apply_status(&mut self, status: PluginStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        match status {
            PluginStatus::Enabled => self.enabled_at = Some(at),
            PluginStatus::Disabled => self.disabled_at = Some(at),
            _ => {}
        }
    }
}

/// Persistence for plugin records.
#[async_trait]
pub trait PluginStore: Send + Sync + Debug {
    /// Fetch one record.
    async fn get(&self, id: &str) -> AppResult<Option<PluginRecord>>;

    /// All records, ordered by ID.
    async fn list(&self) -> AppResult<Vec<PluginRecord>>;

    /// Insert or replace a record by ID.
    async fn upsert(&self, record: PluginRecord) -> AppResult<()>;

    /// Change status, stamping `enabled_at`/`disabled_at` as appropriate.
    async fn set_status(&self, id: &str, status: PluginStatus, at: DateTime<Utc>) -> AppResult<()>;

    /// Replace the stored configuration.
    async fn set_config(&self, id: &str, config: Value) -> AppResult<()>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> AppResult<bool>;
}

fn missing(id: &str) -> AppError {
    AppError::not_found(format!("Plugin record '{id}' not found"))
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryPluginStore {
    records: RwLock<BTreeMap<String, PluginRecord>>,
}

impl MemoryPluginStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PluginStore for MemoryPluginStore {
    async fn get(&self, id: &str) -> AppResult<Option<PluginRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<PluginRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn upsert(&self, record: PluginRecord) -> AppResult<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_status(&self, id: &str, status: PluginStatus, at: DateTime<Utc>) -> AppResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| missing(id))?;
        record.apply_status(status, at);
        Ok(())
    }

    async fn set_config(&self, id: &str, config: Value) -> AppResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| missing(id))?;
        record.config = config;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> AppResult<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

/// Record store persisted as a single JSON document.
///
/// Every mutation is applied to a copy, written to a temporary file, and
/// renamed into place; the in-memory state only changes once the write
/// succeeded.
#[derive(Debug)]
pub struct FilePluginStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, PluginRecord>>,
}

impl FilePluginStore {
    /// Opens the store at `path`, creating an empty one if the file is absent.
    pub async fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(AppError::with_source(
                    ErrorKind::Storage,
                    format!("Failed to read plugin store {}", path.display()),
                    e,
                ));
            }
        };

        debug!(path = %path.display(), count = records.len(), "Plugin store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn write(&self, records: &BTreeMap<String, PluginRecord>) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> AppResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, PluginRecord>) -> AppResult<()> + Send,
    {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        f(&mut next)?;
        self.write(&next).await?;
        *records = next;
        Ok(())
    }
}

#[async_trait]
impl PluginStore for FilePluginStore {
    async fn get(&self, id: &str) -> AppResult<Option<PluginRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<PluginRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, record: PluginRecord) -> AppResult<()> {
        self.mutate(move |records| {
            records.insert(record.id.clone(), record);
            Ok(())
        })
        .await
    }

    async fn set_status(&self, id: &str, status: PluginStatus, at: DateTime<Utc>) -> AppResult<()> {
        self.mutate(|records| {
            let record = records.get_mut(id).ok_or_else(|| missing(id))?;
            record.apply_status(status, at);
            Ok(())
        })
        .await
    }

    async fn set_config(&self, id: &str, config: Value) -> AppResult<()> {
        self.mutate(move |records| {
            let record = records.get_mut(id).ok_or_else(|| missing(id))?;
            record.config = config;
            record.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> AppResult<bool> {
        let mut existed = false;
        self.mutate(|records| {
            existed = records.remove(id).is_some();
            Ok(())
        })
        .await?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(version: &str) -> PluginManifest {
        PluginManifest {
            name: "reports".into(),
            version: version.into(),
            entrypoint: "builtin:reports".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_status_stamps() {
        let store = MemoryPluginStore::new();
        let now = Utc::now();
        store.upsert(PluginRecord::new(&manifest("1.0.0"), now)).await.unwrap();

        store.set_status("reports", PluginStatus::Enabled, now).await.unwrap();
        let record = store.get("reports").await.unwrap().unwrap();
        assert_eq!(record.status, PluginStatus::Enabled);
        assert_eq!(record.enabled_at, Some(now));
        assert!(record.disabled_at.is_none());

        let err = store
            .set_status("missing", PluginStatus::Enabled, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("plugins.json");
        let now = Utc::now();

        {
            let store = FilePluginStore::open(&path).await.unwrap();
            store.upsert(PluginRecord::new(&manifest("1.0.0"), now)).await.unwrap();
            store
                .set_config("reports", json!({"title": "Weekly"}))
                .await
                .unwrap();
            store.set_status("reports", PluginStatus::Disabled, now).await.unwrap();
        }

        let store = FilePluginStore::open(&path).await.unwrap();
        let record = store.get("reports").await.unwrap().unwrap();
        assert_eq!(record.status, PluginStatus::Disabled);
        assert_eq!(record.config, json!({"title": "Weekly"}));
        assert_eq!(record.disabled_at, Some(now));

        assert!(store.delete("reports").await.unwrap());
        assert!(!store.delete("reports").await.unwrap());
        assert!(FilePluginStore::open(&path).await.unwrap().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_failed_mutation_leaves_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePluginStore::open(dir.path().join("plugins.json")).await.unwrap();
        let err = store
            .set_config("missing", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_apply_manifest_keeps_config() {
        let now = Utc::now();
        let mut record = PluginRecord::new(&manifest("1.0.0"), now);
        record.config = json!({"title": "Kept"});
        record.apply_manifest(&manifest("2.0.0"), now);
        assert_eq!(record.version, "2.0.0");
        assert_eq!(record.config, json!({"title": "Kept"}));
    }
}
