//! Plugin manifest (`plugin.json`) types.

pub mod config;
pub mod validator;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::config::{ConfigField, ConfigSchema, ConfigType};
pub use self::validator::{ValidationError, Violation, validate};

/// File name of a manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Declarative description of a plugin.
///
/// Every field defaults when absent so that [`validate`] can report all
/// missing required fields at once instead of failing on the first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin identifier.
    #[serde(default)]
    pub name: String,
    /// Semantic version.
    #[serde(default)]
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Author or maintainer.
    #[serde(default)]
    pub author: String,
    /// Entrypoint reference: `builtin:<name>` or a library path relative to
    /// the plugin directory.
    #[serde(default)]
    pub entrypoint: String,
    /// Plugin ID → semver requirement.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Required permissions, `resource:action`.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Externally exposed handlers.
    #[serde(default)]
    pub routes: Vec<RouteDeclaration>,
    /// Hook bindings.
    #[serde(default)]
    pub hooks: Vec<HookDeclaration>,
    /// Configuration schema and defaults.
    #[serde(default)]
    pub config: ConfigDeclaration,
}

impl PluginManifest {
    /// The plugin identifier.
    pub fn id(&self) -> &str {
        &self.name
    }

    /// Parse a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A route declared by a plugin, relative to its namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteDeclaration {
    /// Path relative to the plugin namespace, e.g. `/reports/{id}`.
    #[serde(default)]
    pub path: String,
    /// HTTP method.
    #[serde(default)]
    pub method: String,
    /// Name of the route handler the plugin provides.
    #[serde(default)]
    pub handler: String,
    /// Host middleware names requested by the route.
    #[serde(default)]
    pub middleware: Vec<String>,
    /// Permissions required to call the route.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A hook binding declared by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookDeclaration {
    /// Hook (event) name.
    #[serde(default)]
    pub event: String,
    /// Name of the hook handler the plugin provides.
    #[serde(default)]
    pub handler: String,
    /// Priority; higher runs first. Defaults to the registry default.
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Configuration schema and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDeclaration {
    /// Field name → field definition.
    #[serde(default)]
    pub schema: ConfigSchema,
    /// Default values; must be a JSON object.
    #[serde(default = "empty_object")]
    pub defaults: Value,
}

impl Default for ConfigDeclaration {
    fn default() -> Self {
        Self {
            schema: ConfigSchema::new(),
            defaults: empty_object(),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = PluginManifest::from_json(
            &json!({
                "name": "reports",
                "version": "1.2.0",
                "entrypoint": "builtin:reports",
                "dependencies": {"billing": "^1.0"},
                "permissions": ["reports:read"],
                "routes": [{"path": "/summary", "method": "GET", "handler": "summary"}],
                "hooks": [{"event": "invoice:paid", "handler": "on_paid", "priority": 20}],
                "config": {
                    "schema": {"title": {"type": "string", "required": true}},
                    "defaults": {"title": "Monthly"}
                }
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(manifest.id(), "reports");
        assert_eq!(manifest.dependencies["billing"], "^1.0");
        assert_eq!(manifest.hooks[0].priority, Some(20));
        assert!(manifest.config.schema["title"].required);
        assert_eq!(manifest.config.defaults["title"], "Monthly");
    }

    #[test]
    fn test_missing_fields_default() {
        let manifest = PluginManifest::from_json("{}").unwrap();
        assert!(manifest.name.is_empty());
        assert!(manifest.routes.is_empty());
        assert!(manifest.config.defaults.is_object());
    }
}
