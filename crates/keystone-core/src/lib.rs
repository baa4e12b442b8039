//! # keystone-core
//!
//! Core crate for Keystone. Contains configuration schemas, the logging
//! bootstrap, and the unified error system shared by the event bus and
//! the plugin runtime.
//!
//! This crate has **no** internal dependencies on other Keystone crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod result;

pub use config::AppConfig;
pub use error::{AppError, ErrorKind};
pub use result::AppResult;
