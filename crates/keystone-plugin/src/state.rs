//! Per-plugin lifecycle state tracking.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// A manifest was found on disk but is not installed.
    Discovered,
    /// A record exists; the plugin is not loaded.
    Installed,
    /// The plugin's initialize routine is running.
    Initializing,
    /// Hooks and routes are being registered.
    Activating,
    /// Loaded and serving.
    Enabled,
    /// Teardown in progress.
    Deactivating,
    /// Torn down; the record remains.
    Disabled,
    /// Files and record are being removed.
    Uninstalling,
    /// Files and record are gone.
    Removed,
    /// The last enable attempt failed.
    Error,
}

impl PluginState {
    /// Returns the string name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Installed => "installed",
            Self::Initializing => "initializing",
            Self::Activating => "activating",
            Self::Enabled => "enabled",
            Self::Deactivating => "deactivating",
            Self::Disabled => "disabled",
            Self::Uninstalling => "uninstalling",
            Self::Removed => "removed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state per plugin ID, with logged transitions.
#[derive(Debug, Default)]
pub struct StateTracker {
    states: DashMap<String, PluginState>,
}

impl StateTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transition and returns the previous state.
    pub fn transition(&self, plugin_id: &str, to: PluginState) -> Option<PluginState> {
        let from = self.states.insert(plugin_id.to_string(), to);
        if from != Some(to) {
            info!(
                plugin_id = %plugin_id,
                from = from.map(|s| s.as_str()).unwrap_or("none"),
                to = %to,
                "Plugin state transition"
            );
        }
        from
    }

    /// Records `to` only when the plugin has no state yet.
    pub fn observe(&self, plugin_id: &str, to: PluginState) {
        if !self.states.contains_key(plugin_id) {
            self.transition(plugin_id, to);
        }
    }

    /// Current state of a plugin.
    pub fn get(&self, plugin_id: &str) -> Option<PluginState> {
        self.states.get(plugin_id).map(|s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_returns_previous() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.transition("reports", PluginState::Installed), None);
        assert_eq!(
            tracker.transition("reports", PluginState::Initializing),
            Some(PluginState::Installed)
        );
        assert_eq!(tracker.get("reports"), Some(PluginState::Initializing));
    }

    #[test]
    fn test_observe_does_not_override() {
        let tracker = StateTracker::new();
        tracker.transition("reports", PluginState::Enabled);
        tracker.observe("reports", PluginState::Discovered);
        tracker.observe("billing", PluginState::Discovered);
        assert_eq!(tracker.get("reports"), Some(PluginState::Enabled));
        assert_eq!(tracker.get("billing"), Some(PluginState::Discovered));
    }
}
