//! # keystone-plugin
//!
//! Plugin runtime for Keystone. Provides:
//!
//! - Manifest validation (identifier, semver, paths, dependencies, permissions)
//! - Hook registry with priority-ordered bindings and a fault-isolating dispatcher
//! - Plugin lifecycle management (install, enable, disable, reload, uninstall)
//! - A per-plugin capability context (config, logger, events, cache, authorizer)
//! - Route mounting under a primary and a legacy namespace
//! - Persisted plugin records (memory and JSON file stores)
//! - Optional dynamic loading via `libloading` (feature `dynamic`)

pub mod api;
pub mod error;
pub mod hooks;
pub mod loader;
pub mod locks;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;

pub use api::auth::{AllowAllAuthorizer, Authorizer, HeaderPermissionAuthorizer};
pub use api::context::{PluginContext, PluginEvents, PluginLogger};
pub use api::services::{MokaPluginCache, PluginCacheService};
pub use error::PluginError;
pub use hooks::definitions::{HookOutcome, HookPayload};
pub use hooks::dispatcher::HookDispatcher;
pub use hooks::registry::{BindingId, HookBinding, HookHandler, HookRegistry, hook_fn};
pub use loader::{PluginCatalog, PluginLoader};
pub use manager::PluginManager;
pub use manifest::{PluginManifest, ValidationError, Violation, validate};
pub use registry::{LoadedPlugin, Plugin, PluginInfo, PluginRegistry};
pub use routes::{RouteHandler, RouteRequest, RouteResponse, RouteTable, route_fn};
pub use state::PluginState;
pub use store::{FilePluginStore, MemoryPluginStore, PluginRecord, PluginStatus, PluginStore};
