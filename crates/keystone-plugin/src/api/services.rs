//! Cache service handed to plugins, backed by moka.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

/// Cache operations available to plugins.
#[async_trait]
pub trait PluginCacheService: Send + Sync {
    /// Gets a value from cache.
    async fn get(&self, key: &str) -> Option<String>;
    /// Sets a value in cache. A TTL of zero uses the configured default.
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), String>;
    /// Deletes a value from cache.
    async fn delete(&self, key: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    ttl: Duration,
}

/// Per-entry expiry; overwriting an entry restarts its TTL.
struct EntryTtl;

impl Expiry<String, CachedValue> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Shared in-process cache. Each plugin receives a [`ScopedPluginCache`]
/// whose keys are prefixed with `plugin:{id}:`.
#[derive(Clone)]
pub struct MokaPluginCache {
    cache: Cache<String, CachedValue>,
    default_ttl: Duration,
}

impl std::fmt::Debug for MokaPluginCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaPluginCache")
            .field("entries", &self.cache.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl MokaPluginCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: u64, default_ttl_seconds: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryTtl)
            .build();
        Self {
            cache,
            default_ttl: Duration::from_secs(default_ttl_seconds.max(1)),
        }
    }

    /// A view of the cache scoped to one plugin.
    pub fn scoped(&self, plugin_id: &str) -> ScopedPluginCache {
        ScopedPluginCache {
            inner: self.clone(),
            prefix: format!("plugin:{plugin_id}:"),
        }
    }

    /// Removes every entry belonging to a plugin.
    pub async fn clear_plugin(&self, plugin_id: &str) -> usize {
        let prefix = format!("plugin:{plugin_id}:");
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.cache.invalidate(key.as_str()).await;
        }
        debug!(plugin_id = %plugin_id, count = keys.len(), "Cleared plugin cache entries");
        keys.len()
    }
}

/// A plugin's view of the shared cache.
#[derive(Debug, Clone)]
pub struct ScopedPluginCache {
    inner: MokaPluginCache,
    prefix: String,
}

impl ScopedPluginCache {
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl PluginCacheService for ScopedPluginCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.cache.get(&self.key(key)).await.map(|v| v.value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), String> {
        let ttl = if ttl_seconds == 0 {
            self.inner.default_ttl
        } else {
            Duration::from_secs(ttl_seconds)
        };
        self.inner
            .cache
            .insert(
                self.key(key),
                CachedValue {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.inner.cache.invalidate(&self.key(key)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let cache = MokaPluginCache::new(100, 60);
        let reports = cache.scoped("reports");
        let billing = cache.scoped("billing");

        reports.set("token", "abc", 0).await.unwrap();
        assert_eq!(reports.get("token").await, Some("abc".to_string()));
        assert_eq!(billing.get("token").await, None);

        reports.delete("token").await.unwrap();
        assert_eq!(reports.get("token").await, None);
    }

    #[tokio::test]
    async fn test_clear_plugin() {
        let cache = MokaPluginCache::new(100, 60);
        let reports = cache.scoped("reports");
        let billing = cache.scoped("billing");
        reports.set("a", "1", 0).await.unwrap();
        reports.set("b", "2", 0).await.unwrap();
        billing.set("a", "3", 0).await.unwrap();

        assert_eq!(cache.clear_plugin("reports").await, 2);
        assert_eq!(reports.get("a").await, None);
        assert_eq!(billing.get("a").await, Some("3".to_string()));
    }
}
