//! Event bus error types.

use keystone_core::error::{AppError, ErrorKind};
use thiserror::Error;

/// Error returned by a single handler invocation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure reason.
    pub message: String,
}

impl HandlerError {
    /// Creates a new handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<AppError> for HandlerError {
    fn from(err: AppError) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors surfaced by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// `wait_for` deadline exceeded.
    #[error("Timed out after {timeout_ms}ms waiting for event '{event_type}'")]
    Timeout {
        /// The awaited event type.
        event_type: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The bus has been shut down.
    #[error("Event bus is stopped")]
    Stopped,

    /// A handler kept failing after every retry attempt.
    #[error("Handler for '{event_type}' failed after {attempts} attempt(s): {message}")]
    Handler {
        /// The event type being delivered.
        event_type: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure reason.
        message: String,
    },

    /// The event log could not be read or written.
    #[error("Event log error: {0}")]
    Persistence(AppError),
}

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout { .. } => AppError::timeout(err.to_string()),
            BusError::Stopped => AppError::unavailable(err.to_string()),
            BusError::Handler { .. } => AppError::event(err.to_string()),
            BusError::Persistence(inner) => {
                AppError::with_source(ErrorKind::Storage, "Event log error", inner)
            }
        }
    }
}
