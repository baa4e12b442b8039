//! Hook dispatcher: invokes every binding for a hook with fault isolation.
//!
//! Handlers run sequentially in binding order. A handler that returns an
//! error or panics is logged and left out of the results; the remaining
//! handlers still run. There is no timeout: handlers run to completion.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

use super::definitions::{HookOutcome, HookPayload};
use super::registry::HookRegistry;

/// Dispatches hooks to all registered handlers.
#[derive(Debug, Clone)]
pub struct HookDispatcher {
    /// Hook registry.
    registry: Arc<HookRegistry>,
}

impl HookDispatcher {
    /// Creates a new hook dispatcher.
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self { registry }
    }

    /// Fires `hook` with `data` and returns the successful results in binding order.
    pub async fn execute(&self, hook: &str, data: Value) -> Vec<HookOutcome> {
        let bindings = self.registry.bindings_for(hook).await;
        if bindings.is_empty() {
            return Vec::new();
        }

        let payload = HookPayload::new(hook, data);
        debug!(
            hook = %hook,
            invocation_id = %payload.invocation_id,
            handler_count = bindings.len(),
            "Dispatching hook"
        );

        let mut outcomes = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let result = AssertUnwindSafe(binding.handler.handle(&payload))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(value)) => outcomes.push(HookOutcome {
                    plugin_id: binding.plugin_id.clone(),
                    result: value,
                }),
                Ok(Err(message)) => {
                    error!(
                        hook = %hook,
                        plugin_id = %binding.plugin_id,
                        binding_id = binding.id,
                        error = %message,
                        "Hook handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        hook = %hook,
                        plugin_id = %binding.plugin_id,
                        binding_id = binding.id,
                        "Hook handler panicked"
                    );
                }
            }
        }

        outcomes
    }

    /// Returns a reference to the hook registry.
    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::registry::hook_fn;
    use serde_json::json;

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let registry = Arc::new(HookRegistry::new());
        registry
            .register(
                "order:placed",
                "broken",
                hook_fn(|_| async { Err("boom".to_string()) }),
                Some(30),
            )
            .await
            .unwrap();
        registry
            .register(
                "order:placed",
                "panicky",
                hook_fn(|payload: HookPayload| async move {
                    if payload.get("total").is_some() {
                        panic!("unexpected total");
                    }
                    Ok(json!(null))
                }),
                Some(20),
            )
            .await
            .unwrap();
        registry
            .register(
                "order:placed",
                "audit",
                hook_fn(|payload: HookPayload| async move {
                    Ok(json!({"seen": payload.get("total").cloned()}))
                }),
                None,
            )
            .await
            .unwrap();

        let dispatcher = HookDispatcher::new(registry);
        let outcomes = dispatcher
            .execute("order:placed", json!({"total": 99}))
            .await;

        assert_eq!(
            outcomes,
            vec![HookOutcome {
                plugin_id: "audit".into(),
                result: json!({"seen": 99}),
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_hook_is_empty() {
        let dispatcher = HookDispatcher::new(Arc::new(HookRegistry::new()));
        assert!(dispatcher.execute("nothing", json!({})).await.is_empty());
    }
}
