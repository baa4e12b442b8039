//! Unified application error types for Keystone.
//!
//! Crate-level errors (`PluginError`, `BusError`, manifest validation)
//! convert into [`AppError`] at their crate boundary, so binaries and
//! tests only ever match on an [`ErrorKind`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category shared by every Keystone crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No plugin, record, or event matched.
    NotFound,
    /// A manifest, configuration patch, or CLI input was rejected.
    Validation,
    /// The operation does not fit the current lifecycle state.
    Conflict,
    /// A plugin failed to load, initialize, or register.
    Plugin,
    /// An event handler kept failing after its retries.
    Event,
    /// A wait on the event bus expired.
    Timeout,
    /// The event bus no longer accepts work.
    Unavailable,
    /// Plugin directory, record store, or event log I/O failed.
    Storage,
    /// Configuration files or overrides are unusable.
    Configuration,
    /// JSON encoding or decoding failed.
    Serialization,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable upper-case code, as used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Validation => "VALIDATION",
            Self::Conflict => "CONFLICT",
            Self::Plugin => "PLUGIN",
            Self::Event => "EVENT",
            Self::Timeout => "TIMEOUT",
            Self::Unavailable => "UNAVAILABLE",
            Self::Storage => "STORAGE",
            Self::Configuration => "CONFIGURATION",
            Self::Serialization => "SERIALIZATION",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether the caller can fix the problem by changing its input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound | Self::Validation | Self::Conflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned across crate boundaries.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    /// Category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause, if any.
    #[source]
    pub source: Option<BoxError>,
}

macro_rules! kind_constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new(ErrorKind::$kind, message)
            }
        )*
    };
}

impl AppError {
    /// An error without an underlying cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// An error wrapping `source`.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    kind_constructors! {
        /// [`ErrorKind::NotFound`].
        not_found => NotFound,
        /// [`ErrorKind::Validation`].
        validation => Validation,
        /// [`ErrorKind::Storage`].
        storage => Storage,
        /// [`ErrorKind::Configuration`].
        configuration => Configuration,
        /// [`ErrorKind::Event`].
        event => Event,
        /// [`ErrorKind::Timeout`].
        timeout => Timeout,
        /// [`ErrorKind::Unavailable`].
        unavailable => Unavailable,
        /// [`ErrorKind::Internal`].
        internal => Internal,
    }
}

/// The source is not cloneable; clones keep kind and message only.
impl Clone for AppError {
    fn clone(&self) -> Self {
        Self::new(self.kind, self.message.clone())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        let message = format!("Invalid JSON: {err}");
        Self::with_source(ErrorKind::Serialization, message, err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        let message = format!("I/O failure: {err}");
        Self::with_source(ErrorKind::Storage, message, err)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        let message = format!("Unreadable configuration: {err}");
        Self::with_source(ErrorKind::Configuration, message, err)
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let message = format!("Configuration out of range: {err}");
        Self::with_source(ErrorKind::Configuration, message, err)
    }
}
