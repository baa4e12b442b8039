//! Plugin registry: the instances that are currently enabled.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::api::context::PluginContext;
use crate::hooks::registry::{BindingId, HookHandler};
use crate::manifest::PluginManifest;
use crate::routes::RouteHandler;

/// Trait that all plugins must implement.
///
/// Hook and route handlers are resolved by the names a manifest declares.
/// A declared name the plugin cannot resolve fails enable.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Called once per enable with a fresh context.
    async fn initialize(&self, ctx: &PluginContext) -> Result<(), String>;

    /// Called on disable, reload and uninstall. Failures are logged only.
    async fn cleanup(&self) -> Result<(), String> {
        Ok(())
    }

    /// Resolves a hook handler declared in the manifest.
    fn hook_handler(&self, _name: &str) -> Option<Arc<dyn HookHandler>> {
        None
    }

    /// Resolves a route handler declared in the manifest.
    fn route_handler(&self, _name: &str) -> Option<Arc<dyn RouteHandler>> {
        None
    }
}

/// An enabled plugin and everything registered on its behalf.
pub struct LoadedPlugin {
    /// Manifest the plugin was enabled with.
    pub manifest: PluginManifest,
    /// Live instance.
    pub instance: Arc<dyn Plugin>,
    /// Context handed to `initialize`.
    pub context: PluginContext,
    /// Handler names of mounted routes.
    pub mounted_handlers: BTreeSet<String>,
    /// Hook bindings owned by the plugin.
    pub hook_bindings: Vec<BindingId>,
    /// When the plugin became active.
    pub enabled_at: DateTime<Utc>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("hook_bindings", &self.hook_bindings)
            .field("mounted_handlers", &self.mounted_handlers)
            .field("enabled_at", &self.enabled_at)
            .finish()
    }
}

impl LoadedPlugin {
    /// Summary for listings.
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id().to_string(),
            version: self.manifest.version.clone(),
            description: self.manifest.description.clone(),
            author: self.manifest.author.clone(),
            hooks: self
                .manifest
                .hooks
                .iter()
                .map(|h| h.event.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            routes: self
                .manifest
                .routes
                .iter()
                .map(|r| format!("{} {}", r.method.to_uppercase(), r.path))
                .collect(),
            enabled_at: self.enabled_at,
        }
    }
}

/// Metadata about an active plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    /// Plugin identifier.
    pub id: String,
    /// Plugin version string.
    pub version: String,
    /// Plugin description.
    pub description: String,
    /// Author or maintainer.
    pub author: String,
    /// Hook names the plugin is bound to.
    pub hooks: Vec<String>,
    /// Mounted routes as `METHOD /path`.
    pub routes: Vec<String>,
    /// When the plugin became active.
    pub enabled_at: DateTime<Utc>,
}

/// Registry of enabled plugins.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
}

impl PluginRegistry {
    /// Creates a new empty plugin registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an enabled plugin.
    pub async fn insert(&self, plugin: LoadedPlugin) -> Result<Arc<LoadedPlugin>, String> {
        let id = plugin.manifest.id().to_string();
        let mut plugins = self.plugins.write().await;

        if plugins.contains_key(&id) {
            return Err(format!("Plugin '{id}' is already registered"));
        }

        info!(plugin_id = %id, version = %plugin.manifest.version, "Registering plugin");
        let plugin = Arc::new(plugin);
        plugins.insert(id, Arc::clone(&plugin));
        Ok(plugin)
    }

    /// Removes a plugin by ID.
    pub async fn remove(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        let removed = self.plugins.write().await.remove(plugin_id);
        if removed.is_some() {
            info!(plugin_id = %plugin_id, "Plugin unregistered");
        }
        removed
    }

    /// Gets a plugin by ID.
    pub async fn get(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.read().await.get(plugin_id).cloned()
    }

    /// Checks whether a plugin is registered.
    pub async fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.read().await.contains_key(plugin_id)
    }

    /// Lists active plugin summaries sorted by ID.
    pub async fn list(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.read().await;
        let mut infos: Vec<PluginInfo> = plugins.values().map(|p| p.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// IDs of every registered plugin.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns plugin count.
    pub async fn count(&self) -> usize {
        self.plugins.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::AllowAllAuthorizer;
    use crate::api::services::MokaPluginCache;
    use crate::manifest::{HookDeclaration, RouteDeclaration};
    use keystone_core::config::EventBusConfig;
    use keystone_events::EventBus;
    use serde_json::json;

    struct Noop;

    #[async_trait::async_trait]
    impl Plugin for Noop {
        async fn initialize(&self, _ctx: &PluginContext) -> Result<(), String> {
            Ok(())
        }
    }

    fn loaded(id: &str) -> LoadedPlugin {
        let manifest = PluginManifest {
            name: id.to_string(),
            version: "1.0.0".to_string(),
            entrypoint: "builtin:noop".to_string(),
            hooks: vec![
                HookDeclaration {
                    event: "user.login".to_string(),
                    handler: "a".to_string(),
                    priority: None,
                },
                HookDeclaration {
                    event: "user.login".to_string(),
                    handler: "b".to_string(),
                    priority: None,
                },
            ],
            routes: vec![RouteDeclaration {
                path: "/summary".to_string(),
                method: "get".to_string(),
                handler: "summary".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let context = PluginContext::new(
            id,
            json!({}),
            EventBus::new(EventBusConfig::default()),
            Arc::new(MokaPluginCache::new(10, 60).scoped(id)),
            Arc::new(AllowAllAuthorizer),
        );
        LoadedPlugin {
            manifest,
            instance: Arc::new(Noop),
            context,
            mounted_handlers: BTreeSet::new(),
            hook_bindings: Vec::new(),
            enabled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let registry = PluginRegistry::new();
        registry.insert(loaded("reports")).await.unwrap();
        assert!(registry.insert(loaded("reports")).await.is_err());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_list_is_sorted_with_summaries() {
        let registry = PluginRegistry::new();
        registry.insert(loaded("zeta-plugin")).await.unwrap();
        registry.insert(loaded("alpha-plugin")).await.unwrap();

        let infos = registry.list().await;
        assert_eq!(infos[0].id, "alpha-plugin");
        assert_eq!(infos[0].hooks, vec!["user.login".to_string()]);
        assert_eq!(infos[0].routes, vec!["GET /summary".to_string()]);

        assert!(registry.remove("alpha-plugin").await.is_some());
        assert!(!registry.contains("alpha-plugin").await);
        assert_eq!(registry.ids().await, vec!["zeta-plugin".to_string()]);
    }
}
