//! Hook payloads, outcomes, and the lifecycle event names emitted by the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event source used for lifecycle events.
pub const MANAGER_SOURCE: &str = "plugin-manager";

/// Emitted after a plugin record is written by `install`.
pub const PLUGIN_INSTALLED: &str = "plugin:installed";
/// Emitted after a plugin is loaded and persisted as enabled.
pub const PLUGIN_ENABLED: &str = "plugin:enabled";
/// Emitted after a plugin is torn down and persisted as disabled.
pub const PLUGIN_DISABLED: &str = "plugin:disabled";
/// Emitted after a plugin's files and record are deleted.
pub const PLUGIN_UNINSTALLED: &str = "plugin:uninstalled";
/// Emitted after a plugin's stored configuration changes.
pub const PLUGIN_CONFIG_UPDATED: &str = "plugin:config_updated";

/// Payload passed to every handler bound to a hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPayload {
    /// Unique invocation ID.
    pub invocation_id: Uuid,
    /// The hook being fired.
    pub hook: String,
    /// Caller-supplied data.
    pub data: Value,
    /// When the hook was fired.
    pub timestamp: DateTime<Utc>,
}

impl HookPayload {
    /// Creates a new payload.
    pub fn new(hook: impl Into<String>, data: Value) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            hook: hook.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Gets a field from the data object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Gets a string field from the data object.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Result of one successful hook handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookOutcome {
    /// Plugin that produced the result.
    pub plugin_id: String,
    /// Value returned by the handler.
    pub result: Value,
}
