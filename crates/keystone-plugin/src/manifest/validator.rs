//! Manifest validation.
//!
//! [`validate`] is pure and collects every violation before failing so
//! callers can report the complete set.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use semver::{Version, VersionReq};
use serde::Serialize;
use thiserror::Error;

use super::PluginManifest;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9-]{2,49}$").expect("identifier pattern compiles")
});

static PERMISSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.*-]+:[A-Za-z0-9_.*-]+$").expect("permission pattern compiles")
});

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// A single manifest problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Offending field, e.g. `routes[1].path`.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl Violation {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Manifest validation failed: {}", join(.violations))]
pub struct ValidationError {
    /// The violations, in check order.
    pub violations: Vec<Violation>,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Returns whether `id` is a well-formed plugin identifier.
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id) && !id.ends_with('-')
}

fn is_valid_permission(permission: &str) -> bool {
    PERMISSION_PATTERN.is_match(permission)
}

fn has_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Rooted paths, including Windows drive paths such as `C:\x.dll`.
fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with(['/', '\\'])
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && matches!(bytes[2], b'/' | b'\\'))
}

/// Validate a manifest.
pub fn validate(manifest: &PluginManifest) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    check_identity(manifest, &mut violations);
    check_entrypoint(manifest, &mut violations);
    check_routes(manifest, &mut violations);
    check_hooks(manifest, &mut violations);
    check_dependencies(manifest, &mut violations);
    check_permissions(&manifest.permissions, "permissions", &mut violations);
    check_config(manifest, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

fn check_identity(manifest: &PluginManifest, violations: &mut Vec<Violation>) {
    if manifest.name.is_empty() {
        violations.push(Violation::new("name", "is required"));
    } else if !is_valid_id(&manifest.name) {
        violations.push(Violation::new(
            "name",
            "must match [a-z][a-z0-9-]{2,49} and not end with '-'",
        ));
    }

    if manifest.version.is_empty() {
        violations.push(Violation::new("version", "is required"));
    } else if let Err(e) = Version::parse(&manifest.version) {
        violations.push(Violation::new(
            "version",
            format!("is not a valid semantic version: {e}"),
        ));
    }
}

fn check_entrypoint(manifest: &PluginManifest, violations: &mut Vec<Violation>) {
    if manifest.entrypoint.trim().is_empty() {
        violations.push(Violation::new("entrypoint", "is required"));
    } else if is_absolute(&manifest.entrypoint) {
        violations.push(Violation::new(
            "entrypoint",
            "must be relative to the plugin directory",
        ));
    } else if has_traversal(&manifest.entrypoint) {
        violations.push(Violation::new(
            "entrypoint",
            "must not contain '..' segments",
        ));
    }
}

fn check_routes(manifest: &PluginManifest, violations: &mut Vec<Violation>) {
    for (i, route) in manifest.routes.iter().enumerate() {
        let field = format!("routes[{i}]");

        if !route.path.starts_with('/') {
            violations.push(Violation::new(
                format!("{field}.path"),
                "must start with '/'",
            ));
        }
        if has_traversal(&route.path) {
            violations.push(Violation::new(
                format!("{field}.path"),
                "must not contain '..' segments",
            ));
        }
        if !HTTP_METHODS.contains(&route.method.to_ascii_uppercase().as_str()) {
            violations.push(Violation::new(
                format!("{field}.method"),
                format!("unknown HTTP method '{}'", route.method),
            ));
        }
        if route.handler.trim().is_empty() {
            violations.push(Violation::new(format!("{field}.handler"), "is required"));
        }
        if route.middleware.iter().any(|m| m.trim().is_empty()) {
            violations.push(Violation::new(
                format!("{field}.middleware"),
                "must not contain empty names",
            ));
        }
        check_permissions(
            &route.permissions,
            &format!("{field}.permissions"),
            violations,
        );
    }
}

fn check_hooks(manifest: &PluginManifest, violations: &mut Vec<Violation>) {
    for (i, hook) in manifest.hooks.iter().enumerate() {
        if hook.event.trim().is_empty() {
            violations.push(Violation::new(format!("hooks[{i}].event"), "is required"));
        }
        if hook.handler.trim().is_empty() {
            violations.push(Violation::new(
                format!("hooks[{i}].handler"),
                "is required",
            ));
        }
    }
}

fn check_dependencies(manifest: &PluginManifest, violations: &mut Vec<Violation>) {
    for (dependency, requirement) in &manifest.dependencies {
        let field = format!("dependencies.{dependency}");

        if dependency == &manifest.name {
            violations.push(Violation::new(field.clone(), "a plugin cannot depend on itself"));
        }
        if !is_valid_id(dependency) {
            violations.push(Violation::new(
                field.clone(),
                "dependency is not a valid plugin identifier",
            ));
        }
        if let Err(e) = VersionReq::parse(requirement) {
            violations.push(Violation::new(
                field,
                format!("invalid version requirement '{requirement}': {e}"),
            ));
        }
    }
}

fn check_permissions(permissions: &[String], field: &str, violations: &mut Vec<Violation>) {
    for permission in permissions {
        if !is_valid_permission(permission) {
            violations.push(Violation::new(
                field,
                format!("'{permission}' is not of the form resource:action"),
            ));
        }
    }
}

fn check_config(manifest: &PluginManifest, violations: &mut Vec<Violation>) {
    let Some(defaults) = manifest.config.defaults.as_object() else {
        violations.push(Violation::new("config.defaults", "must be an object"));
        return;
    };

    for (name, field) in &manifest.config.schema {
        if let (Some(expected), Some(value)) = (field.field_type, defaults.get(name)) {
            if !value.is_null() && !expected.matches(value) {
                violations.push(Violation::new(
                    format!("config.defaults.{name}"),
                    format!("default does not match declared type {expected:?}"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{HookDeclaration, RouteDeclaration};
    use serde_json::json;

    fn valid() -> PluginManifest {
        PluginManifest {
            name: "reports".into(),
            version: "1.0.0".into(),
            entrypoint: "builtin:reports".into(),
            permissions: vec!["reports:read".into()],
            routes: vec![RouteDeclaration {
                path: "/summary/{month}".into(),
                method: "get".into(),
                handler: "summary".into(),
                ..Default::default()
            }],
            hooks: vec![HookDeclaration {
                event: "invoice:paid".into(),
                handler: "on_paid".into(),
                priority: None,
            }],
            ..Default::default()
        }
    }

    fn fields(err: &ValidationError) -> Vec<&str> {
        err.violations.iter().map(|v| v.field.as_str()).collect()
    }

    #[test]
    fn test_valid_manifest() {
        assert!(validate(&valid()).is_ok());
    }

    #[test]
    fn test_collects_all_required() {
        let err = validate(&PluginManifest::default()).unwrap_err();
        assert_eq!(fields(&err), vec!["name", "version", "entrypoint"]);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_id("abc"));
        assert!(is_valid_id("my-plugin2"));
        assert!(!is_valid_id("ab"));
        assert!(!is_valid_id("Reports"));
        assert!(!is_valid_id("1abc"));
        assert!(!is_valid_id("reports-"));
        assert!(!is_valid_id(&format!("a{}", "b".repeat(50))));
        assert!(is_valid_id(&format!("a{}", "b".repeat(49))));
    }

    #[test]
    fn test_bad_version() {
        let mut manifest = valid();
        manifest.version = "1.0".into();
        let err = validate(&manifest).unwrap_err();
        assert_eq!(fields(&err), vec!["version"]);
    }

    #[test]
    fn test_traversal_rejected() {
        let mut manifest = valid();
        manifest.entrypoint = "../../lib/evil.so".into();
        manifest.routes[0].path = "/files/../secrets".into();
        let err = validate(&manifest).unwrap_err();
        assert_eq!(fields(&err), vec!["entrypoint", "routes[0].path"]);
    }

    #[test]
    fn test_absolute_entrypoint_rejected() {
        let rooted = ["/usr/lib/x.so", "\\\\server\\x.dll", "C:\\plugins\\x.dll", "c:/x.dll"];
        for entrypoint in rooted {
            let mut manifest = valid();
            manifest.entrypoint = entrypoint.into();
            let err = validate(&manifest).unwrap_err();
            assert_eq!(fields(&err), vec!["entrypoint"], "{entrypoint}");
        }
        let mut manifest = valid();
        manifest.entrypoint = "lib/reports.so".into();
        assert!(validate(&manifest).is_ok());
    }

    #[test]
    fn test_patterns_compile() {
        assert!(ID_PATTERN.is_match("reports"));
        assert!(PERMISSION_PATTERN.is_match("reports:read"));
    }

    #[test]
    fn test_dotted_names_are_not_traversal() {
        let mut manifest = valid();
        manifest.entrypoint = "lib/reports..v2.so".into();
        assert!(validate(&manifest).is_ok());
    }

    #[test]
    fn test_route_checks() {
        let mut manifest = valid();
        manifest.routes.push(RouteDeclaration {
            path: "summary".into(),
            method: "FETCH".into(),
            handler: String::new(),
            middleware: vec![],
            permissions: vec!["reports".into()],
        });
        let err = validate(&manifest).unwrap_err();
        assert_eq!(
            fields(&err),
            vec![
                "routes[1].path",
                "routes[1].method",
                "routes[1].handler",
                "routes[1].permissions"
            ]
        );
    }

    #[test]
    fn test_dependency_checks() {
        let mut manifest = valid();
        manifest
            .dependencies
            .insert("reports".into(), "^1".into());
        manifest
            .dependencies
            .insert("billing".into(), "not-a-range".into());
        let err = validate(&manifest).unwrap_err();
        assert_eq!(
            fields(&err),
            vec!["dependencies.billing", "dependencies.reports"]
        );
    }

    #[test]
    fn test_config_defaults_must_be_object() {
        let mut manifest = valid();
        manifest.config.defaults = json!([1, 2]);
        let err = validate(&manifest).unwrap_err();
        assert_eq!(fields(&err), vec!["config.defaults"]);
    }

    #[test]
    fn test_config_default_type_mismatch() {
        let mut manifest = valid();
        manifest.config.schema =
            serde_json::from_value(json!({"limit": {"type": "integer"}})).unwrap();
        manifest.config.defaults = json!({"limit": "ten"});
        let err = validate(&manifest).unwrap_err();
        assert_eq!(fields(&err), vec!["config.defaults.limit"]);
    }

    #[test]
    fn test_error_message_lists_violations() {
        let err = validate(&PluginManifest::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("name: is required"));
        assert!(message.contains("entrypoint: is required"));
    }
}
