//! Plugin lifecycle errors.

use keystone_core::error::{AppError, ErrorKind};
use thiserror::Error;

use crate::manifest::ValidationError;

/// Errors returned by [`crate::PluginManager`] operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The manifest is invalid. Nothing was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The effective configuration does not satisfy the manifest schema.
    #[error(
        "Invalid configuration for plugin '{plugin_id}': missing [{}], invalid [{}]",
        .missing.join(", "),
        .invalid.join(", ")
    )]
    ConfigValidation {
        /// Plugin ID.
        plugin_id: String,
        /// Required keys that are absent.
        missing: Vec<String>,
        /// Keys whose value has the wrong type.
        invalid: Vec<String>,
    },

    /// A declared dependency is not installed.
    #[error("Plugin '{plugin_id}' requires '{dependency}', which is not installed")]
    MissingDependency {
        /// Plugin being installed.
        plugin_id: String,
        /// Missing dependency ID.
        dependency: String,
    },

    /// A declared dependency is installed at an incompatible version.
    #[error(
        "Plugin '{plugin_id}' requires '{dependency}' {required}, but version {found} is installed"
    )]
    IncompatibleDependency {
        /// Plugin being installed.
        plugin_id: String,
        /// Dependency ID.
        dependency: String,
        /// Declared requirement.
        required: String,
        /// Installed version.
        found: String,
    },

    /// The plugin is already loaded.
    #[error("Plugin '{0}' is already enabled")]
    AlreadyEnabled(String),

    /// The plugin is not loaded.
    #[error("Plugin '{0}' is not loaded")]
    NotLoaded(String),

    /// No record exists for the plugin.
    #[error("Plugin '{0}' is not installed")]
    NotInstalled(String),

    /// The plugin could not be instantiated.
    #[error("Failed to load plugin '{plugin_id}': {message}")]
    Load {
        /// Plugin ID.
        plugin_id: String,
        /// Failure reason.
        message: String,
    },

    /// The plugin's initialize routine failed.
    #[error("Plugin '{plugin_id}' failed to initialize: {message}")]
    Initialize {
        /// Plugin ID.
        plugin_id: String,
        /// Failure reason.
        message: String,
    },

    /// A declared hook could not be registered. No bindings remain.
    #[error("Plugin '{plugin_id}' failed to register hook '{event}': {message}")]
    HookRegistration {
        /// Plugin ID.
        plugin_id: String,
        /// Hook name.
        event: String,
        /// Failure reason.
        message: String,
    },

    /// Routes could not be mounted. No routes remain.
    #[error("Plugin '{plugin_id}' failed to mount routes: {message}")]
    RouteMount {
        /// Plugin ID.
        plugin_id: String,
        /// Failure reason.
        message: String,
    },

    /// A filesystem operation failed. The record is untouched.
    #[error("Plugin '{plugin_id}' {operation} failed: {source}")]
    Operation {
        /// Plugin ID.
        plugin_id: String,
        /// What was being done.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A plugin record could not be read or written.
    #[error("Plugin '{plugin_id}' record persistence failed: {source}")]
    Persistence {
        /// Plugin ID.
        plugin_id: String,
        /// Underlying store error.
        #[source]
        source: AppError,
    },
}

impl PluginError {
    /// Wrap a store error for `plugin_id`.
    pub fn persistence(plugin_id: &str, source: AppError) -> Self {
        Self::Persistence {
            plugin_id: plugin_id.to_string(),
            source,
        }
    }

    /// The [`ErrorKind`] this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::ConfigValidation { .. } => ErrorKind::Validation,
            Self::MissingDependency { .. }
            | Self::IncompatibleDependency { .. }
            | Self::AlreadyEnabled(_)
            | Self::NotLoaded(_) => ErrorKind::Conflict,
            Self::NotInstalled(_) => ErrorKind::NotFound,
            Self::Load { .. }
            | Self::Initialize { .. }
            | Self::HookRegistration { .. }
            | Self::RouteMount { .. } => ErrorKind::Plugin,
            Self::Operation { .. } | Self::Persistence { .. } => ErrorKind::Storage,
        }
    }
}

impl From<PluginError> for AppError {
    fn from(err: PluginError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        AppError::with_source(kind, message, err)
    }
}
