//! Keystone host: HTTP surface over the plugin runtime.

pub mod app;
