//! Hook registry. Plugins bind handlers to named hooks with priority ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::definitions::HookPayload;

/// Priority used when a hook declaration does not set one.
pub const DEFAULT_HOOK_PRIORITY: i32 = 10;

/// Identifier of a single binding.
pub type BindingId = u64;

/// Trait for hook handler implementations.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Handles a hook invocation.
    async fn handle(&self, payload: &HookPayload) -> Result<Value, String>;
}

type BoxedHookFn = Arc<dyn Fn(HookPayload) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// A closure-based hook handler.
pub struct FnHookHandler {
    handler: BoxedHookFn,
}

#[async_trait]
impl HookHandler for FnHookHandler {
    async fn handle(&self, payload: &HookPayload) -> Result<Value, String> {
        (self.handler)(payload.clone()).await
    }
}

/// Wraps a closure into an `Arc<dyn HookHandler>`.
pub fn hook_fn<F, Fut>(handler: F) -> Arc<dyn HookHandler>
where
    F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnHookHandler {
        handler: Arc::new(move |payload| Box::pin(handler(payload))),
    })
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The hook name is empty.
    #[error("Hook name must not be empty")]
    EmptyHook,
    /// The owning plugin ID is empty.
    #[error("Owning plugin ID must not be empty")]
    EmptyPlugin,
}

/// A handler bound to a hook.
#[derive(Clone)]
pub struct HookBinding {
    /// Binding ID, also the registration sequence number.
    pub id: BindingId,
    /// Hook name.
    pub hook: String,
    /// Owning plugin.
    pub plugin_id: String,
    /// The handler.
    pub handler: Arc<dyn HookHandler>,
    /// Priority (higher = earlier execution).
    pub priority: i32,
}

impl std::fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBinding")
            .field("id", &self.id)
            .field("hook", &self.hook)
            .field("plugin_id", &self.plugin_id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Registry of hook bindings organized by hook name.
#[derive(Debug)]
pub struct HookRegistry {
    /// Hook name → bindings sorted by descending priority, then registration order.
    bindings: RwLock<HashMap<String, Vec<HookBinding>>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Binds a handler to a hook.
    pub async fn register(
        &self,
        hook: &str,
        plugin_id: &str,
        handler: Arc<dyn HookHandler>,
        priority: Option<i32>,
    ) -> Result<BindingId, HookError> {
        if hook.trim().is_empty() {
            return Err(HookError::EmptyHook);
        }
        if plugin_id.is_empty() {
            return Err(HookError::EmptyPlugin);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let priority = priority.unwrap_or(DEFAULT_HOOK_PRIORITY);

        let mut bindings = self.bindings.write().await;
        let entries = bindings.entry(hook.to_string()).or_default();
        entries.push(HookBinding {
            id,
            hook: hook.to_string(),
            plugin_id: plugin_id.to_string(),
            handler,
            priority,
        });
        // IDs grow monotonically, so they double as the tie-breaker.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        debug!(
            hook = %hook,
            plugin_id = %plugin_id,
            priority,
            binding_id = id,
            "Hook handler registered"
        );
        Ok(id)
    }

    /// Removes specific bindings (rollback of a failed enable).
    pub async fn remove_bindings(&self, ids: &[BindingId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut bindings = self.bindings.write().await;
        let mut removed = 0;
        for entries in bindings.values_mut() {
            let before = entries.len();
            entries.retain(|b| !ids.contains(&b.id));
            removed += before - entries.len();
        }
        bindings.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Removes every binding owned by a plugin under a single write lock.
    pub async fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut bindings = self.bindings.write().await;
        let mut removed = 0;
        for entries in bindings.values_mut() {
            let before = entries.len();
            entries.retain(|b| b.plugin_id != plugin_id);
            removed += before - entries.len();
        }
        bindings.retain(|_, entries| !entries.is_empty());

        info!(plugin_id = %plugin_id, removed, "All hooks unregistered for plugin");
        removed
    }

    /// Returns the bindings for a hook in execution order.
    pub async fn bindings_for(&self, hook: &str) -> Vec<HookBinding> {
        let bindings = self.bindings.read().await;
        bindings.get(hook).cloned().unwrap_or_default()
    }

    /// Returns the number of bindings owned by a plugin.
    pub async fn count_for_plugin(&self, plugin_id: &str) -> usize {
        let bindings = self.bindings.read().await;
        bindings
            .values()
            .flatten()
            .filter(|b| b.plugin_id == plugin_id)
            .count()
    }

    /// Returns every hook name with at least one binding, sorted.
    pub async fn registered_events(&self) -> Vec<String> {
        let bindings = self.bindings.read().await;
        let mut hooks: Vec<String> = bindings.keys().cloned().collect();
        hooks.sort();
        hooks
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler() -> Arc<dyn HookHandler> {
        hook_fn(|_| async { Ok(json!(null)) })
    }

    #[tokio::test]
    async fn test_descending_priority_ties_by_registration() {
        let registry = HookRegistry::new();
        let low = registry
            .register("order:placed", "audit", handler(), Some(1))
            .await
            .unwrap();
        let first = registry
            .register("order:placed", "billing", handler(), None)
            .await
            .unwrap();
        let second = registry
            .register("order:placed", "reports", handler(), None)
            .await
            .unwrap();
        let high = registry
            .register("order:placed", "fraud", handler(), Some(50))
            .await
            .unwrap();

        let ids: Vec<_> = registry
            .bindings_for("order:placed")
            .await
            .iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![high, first, second, low]);
    }

    #[tokio::test]
    async fn test_rejects_empty_hook() {
        let registry = HookRegistry::new();
        let err = registry.register(" ", "audit", handler(), None).await;
        assert_eq!(err, Err(HookError::EmptyHook));
    }

    #[tokio::test]
    async fn test_unregister_plugin_removes_everything() {
        let registry = HookRegistry::new();
        registry.register("a", "audit", handler(), None).await.unwrap();
        registry.register("b", "audit", handler(), None).await.unwrap();
        registry.register("b", "billing", handler(), None).await.unwrap();

        assert_eq!(registry.unregister_plugin("audit").await, 2);
        assert_eq!(registry.count_for_plugin("audit").await, 0);
        assert_eq!(registry.registered_events().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_remove_bindings() {
        let registry = HookRegistry::new();
        let a = registry.register("a", "audit", handler(), None).await.unwrap();
        let b = registry.register("b", "audit", handler(), None).await.unwrap();
        registry.register("b", "audit", handler(), None).await.unwrap();

        assert_eq!(registry.remove_bindings(&[a, b]).await, 2);
        assert_eq!(registry.count_for_plugin("audit").await, 1);
        assert!(registry.bindings_for("a").await.is_empty());
    }
}
