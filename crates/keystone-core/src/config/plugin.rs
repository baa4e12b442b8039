//! Plugin runtime configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Plugin runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PluginConfig {
    /// Directory holding one sub-directory per installed plugin.
    #[serde(default = "default_plugin_directory")]
    pub directory: String,
    /// Path of the JSON document holding persisted plugin records.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Whether to re-enable plugins persisted as enabled on startup.
    #[serde(default = "default_true")]
    pub auto_restore: bool,
    /// Primary namespace under which plugin routes are mounted.
    #[serde(default = "default_primary_prefix")]
    #[validate(length(min = 2))]
    pub primary_prefix: String,
    /// Legacy-compatible alias namespace for plugin routes.
    #[serde(default = "default_legacy_prefix")]
    #[validate(length(min = 2))]
    pub legacy_prefix: String,
    /// Default time-to-live for entries written through the plugin cache.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    /// Maximum number of entries held by the plugin cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_directory(),
            store_path: default_store_path(),
            auto_restore: default_true(),
            primary_prefix: default_primary_prefix(),
            legacy_prefix: default_legacy_prefix(),
            cache_ttl_seconds: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_plugin_directory() -> String {
    "./data/plugins".to_string()
}

fn default_store_path() -> String {
    "./data/plugins.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_primary_prefix() -> String {
    "/api/plugins".to_string()
}

fn default_legacy_prefix() -> String {
    "/plugins".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_capacity() -> u64 {
    10_000
}
