//! Capabilities handed to plugins.

pub mod auth;
pub mod context;
pub mod services;
