//! Plugin manager: lifecycle management for all plugins.
//!
//! Every operation on a plugin ID runs under that ID's operation lock, so
//! the "already enabled" check and the registry insertion cannot race.
//! Enable is transactional: a failure at any step removes whatever the
//! attempt registered before returning.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use keystone_core::config::PluginConfig;
use keystone_core::error::AppError;
use keystone_core::result::AppResult;
use keystone_events::EventBus;
use semver::{Version, VersionReq};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::api::auth::{AllowAllAuthorizer, Authorizer};
use crate::api::context::PluginContext;
use crate::api::services::MokaPluginCache;
use crate::error::PluginError;
use crate::hooks::definitions::{
    HookOutcome, MANAGER_SOURCE, PLUGIN_CONFIG_UPDATED, PLUGIN_DISABLED, PLUGIN_ENABLED,
    PLUGIN_INSTALLED, PLUGIN_UNINSTALLED,
};
use crate::hooks::dispatcher::HookDispatcher;
use crate::hooks::registry::{BindingId, HookRegistry};
use crate::loader::{PluginCatalog, PluginLoader};
use crate::locks::OperationLocks;
use crate::manifest::config::{overlay, validate_config};
use crate::manifest::{MANIFEST_FILE, PluginManifest, validate};
use crate::registry::{LoadedPlugin, Plugin, PluginInfo, PluginRegistry};
use crate::routes::RouteTable;
use crate::state::{PluginState, StateTracker};
use crate::store::{PluginRecord, PluginStatus, PluginStore};

/// Request body limit for plugin routes when the host does not set one.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Manages the full lifecycle of plugins: install, enable, disable,
/// reload, uninstall.
#[derive(Debug)]
pub struct PluginManager {
    config: PluginConfig,
    store: Arc<dyn PluginStore>,
    bus: EventBus,
    loader: PluginLoader,
    dispatcher: HookDispatcher,
    registry: PluginRegistry,
    routes: Arc<RouteTable>,
    cache: MokaPluginCache,
    authorizer: Arc<dyn Authorizer>,
    body_limit: usize,
    states: StateTracker,
    locks: OperationLocks,
}

impl PluginManager {
    /// Creates a manager that allows every route request.
    pub fn new(
        config: PluginConfig,
        store: Arc<dyn PluginStore>,
        bus: EventBus,
        catalog: PluginCatalog,
    ) -> Self {
        let authorizer: Arc<dyn Authorizer> = Arc::new(AllowAllAuthorizer);
        let routes = Arc::new(RouteTable::new(
            &config.primary_prefix,
            &config.legacy_prefix,
            Arc::clone(&authorizer),
            DEFAULT_BODY_LIMIT,
        ));
        let cache = MokaPluginCache::new(config.cache_capacity, config.cache_ttl_seconds);
        let loader = PluginLoader::new(&config.directory, catalog);

        Self {
            config,
            store,
            bus,
            loader,
            dispatcher: HookDispatcher::new(Arc::new(HookRegistry::new())),
            registry: PluginRegistry::new(),
            routes,
            cache,
            authorizer,
            body_limit: DEFAULT_BODY_LIMIT,
            states: StateTracker::new(),
            locks: OperationLocks::new(),
        }
    }

    /// Uses `authorizer` for routes that declare permissions.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self.rebuild_routes();
        self
    }

    /// Caps request bodies accepted by plugin routes.
    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self.rebuild_routes();
        self
    }

    fn rebuild_routes(&mut self) {
        self.routes = Arc::new(RouteTable::new(
            &self.config.primary_prefix,
            &self.config.legacy_prefix,
            Arc::clone(&self.authorizer),
            self.body_limit,
        ));
    }

    // ── Install ──

    /// Validates and installs (or reinstalls) a plugin.
    ///
    /// Reinstalling replaces the manifest-derived fields in place and keeps
    /// the stored configuration. A loaded plugin keeps running with its
    /// previous manifest until it is reloaded.
    pub async fn install(&self, manifest: PluginManifest) -> Result<PluginRecord, PluginError> {
        validate(&manifest)?;
        let id = manifest.id().to_string();
        let _guard = self.locks.acquire(&id).await;

        self.check_dependencies(&manifest).await?;
        let existing = self
            .store
            .get(&id)
            .await
            .map_err(|e| PluginError::persistence(&id, e))?;

        self.write_manifest(&manifest).await?;

        let now = Utc::now();
        let loaded = self.registry.contains(&id).await;
        let record = match existing {
            Some(mut record) => {
                record.apply_manifest(&manifest, now);
                if !loaded {
                    record.status = PluginStatus::Installed;
                }
                record
            }
            None => PluginRecord::new(&manifest, now),
        };
        self.store
            .upsert(record.clone())
            .await
            .map_err(|e| PluginError::persistence(&id, e))?;

        if !loaded {
            self.states.transition(&id, PluginState::Installed);
        }
        info!(plugin_id = %id, version = %record.version, "Plugin installed");
        self.emit(
            PLUGIN_INSTALLED,
            json!({ "plugin_id": id, "version": record.version }),
        )
        .await;

        Ok(record)
    }

    async fn check_dependencies(&self, manifest: &PluginManifest) -> Result<(), PluginError> {
        for (dependency, requirement) in &manifest.dependencies {
            let record = self
                .store
                .get(dependency)
                .await
                .map_err(|e| PluginError::persistence(manifest.id(), e))?;

            let Some(record) = record.filter(|r| {
                matches!(r.status, PluginStatus::Installed | PluginStatus::Enabled)
            }) else {
                return Err(PluginError::MissingDependency {
                    plugin_id: manifest.id().to_string(),
                    dependency: dependency.clone(),
                });
            };

            let satisfied = match (VersionReq::parse(requirement), Version::parse(&record.version))
            {
                (Ok(req), Ok(version)) => req.matches(&version),
                _ => false,
            };
            if !satisfied {
                return Err(PluginError::IncompatibleDependency {
                    plugin_id: manifest.id().to_string(),
                    dependency: dependency.clone(),
                    required: requirement.clone(),
                    found: record.version,
                });
            }
        }
        Ok(())
    }

    fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.loader.plugin_dir().join(plugin_id)
    }

    async fn write_manifest(&self, manifest: &PluginManifest) -> Result<(), PluginError> {
        let id = manifest.id();
        let operation = |source: std::io::Error| PluginError::Operation {
            plugin_id: id.to_string(),
            operation: "install",
            source,
        };

        let dir = self.plugin_dir(id);
        tokio::fs::create_dir_all(&dir).await.map_err(operation)?;
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| operation(std::io::Error::other(e)))?;
        tokio::fs::write(dir.join(MANIFEST_FILE), bytes)
            .await
            .map_err(operation)?;

        debug!(plugin_id = %id, path = %dir.display(), "Manifest written");
        Ok(())
    }

    // ── Enable ──

    /// Loads, initializes and activates an installed plugin.
    pub async fn enable(&self, plugin_id: &str) -> Result<PluginInfo, PluginError> {
        let _guard = self.locks.acquire(plugin_id).await;
        self.enable_locked(plugin_id).await
    }

    async fn enable_locked(&self, id: &str) -> Result<PluginInfo, PluginError> {
        if self.registry.contains(id).await {
            return Err(PluginError::AlreadyEnabled(id.to_string()));
        }
        let record = self
            .store
            .get(id)
            .await
            .map_err(|e| PluginError::persistence(id, e))?
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;
        let manifest = record.manifest;

        self.states.transition(id, PluginState::Initializing);
        let effective = overlay(&manifest.config.defaults, &record.config);
        let context = PluginContext::new(
            id,
            effective,
            self.bus.clone(),
            Arc::new(self.cache.scoped(id)),
            Arc::clone(&self.authorizer),
        );

        let instance = match self.loader.load(&manifest) {
            Ok(instance) => instance,
            Err(message) => {
                self.mark_error(id).await;
                return Err(PluginError::Load {
                    plugin_id: id.to_string(),
                    message,
                });
            }
        };

        let initialized = AssertUnwindSafe(instance.initialize(&context))
            .catch_unwind()
            .await;
        let failure = match initialized {
            Ok(Ok(())) => None,
            Ok(Err(message)) => Some(message),
            Err(_) => Some("initialize panicked".to_string()),
        };
        if let Some(message) = failure {
            error!(plugin_id = %id, error = %message, "Plugin initialization failed");
            self.bus.unsubscribe_subscriber(id).await;
            self.mark_error(id).await;
            return Err(PluginError::Initialize {
                plugin_id: id.to_string(),
                message,
            });
        }

        self.states.transition(id, PluginState::Activating);
        let hooks = self.dispatcher.registry();

        let mut bindings: Vec<BindingId> = Vec::with_capacity(manifest.hooks.len());
        for declaration in &manifest.hooks {
            let registered = match instance.hook_handler(&declaration.handler) {
                Some(handler) => hooks
                    .register(&declaration.event, id, handler, declaration.priority)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err(format!(
                    "plugin does not provide hook handler '{}'",
                    declaration.handler
                )),
            };
            match registered {
                Ok(binding) => bindings.push(binding),
                Err(message) => {
                    hooks.remove_bindings(&bindings).await;
                    self.abort_enable(id, &instance).await;
                    return Err(PluginError::HookRegistration {
                        plugin_id: id.to_string(),
                        event: declaration.event.clone(),
                        message,
                    });
                }
            }
        }

        let mut routes = Vec::with_capacity(manifest.routes.len());
        let mut unresolved = None;
        for declaration in &manifest.routes {
            match instance.route_handler(&declaration.handler) {
                Some(handler) => routes.push((declaration.clone(), handler)),
                None => {
                    unresolved = Some(format!(
                        "plugin does not provide route handler '{}'",
                        declaration.handler
                    ));
                    break;
                }
            }
        }
        let mounted = match unresolved {
            Some(message) => Err(message),
            None => self.routes.mount(id, routes).await,
        };
        if let Err(message) = mounted {
            hooks.remove_bindings(&bindings).await;
            self.abort_enable(id, &instance).await;
            return Err(PluginError::RouteMount {
                plugin_id: id.to_string(),
                message,
            });
        }

        let now = Utc::now();
        let loaded = LoadedPlugin {
            mounted_handlers: manifest.routes.iter().map(|r| r.handler.clone()).collect(),
            manifest,
            instance: Arc::clone(&instance),
            context,
            hook_bindings: bindings.clone(),
            enabled_at: now,
        };
        let loaded = match self.registry.insert(loaded).await {
            Ok(loaded) => loaded,
            Err(_) => {
                self.routes.unmount(id).await;
                hooks.remove_bindings(&bindings).await;
                self.abort_enable(id, &instance).await;
                return Err(PluginError::AlreadyEnabled(id.to_string()));
            }
        };

        if let Err(e) = self.store.set_status(id, PluginStatus::Enabled, now).await {
            self.registry.remove(id).await;
            self.routes.unmount(id).await;
            hooks.remove_bindings(&bindings).await;
            self.abort_enable(id, &instance).await;
            return Err(PluginError::persistence(id, e));
        }

        self.states.transition(id, PluginState::Enabled);
        let info = loaded.info();
        info!(
            plugin_id = %id,
            version = %info.version,
            hooks = bindings.len(),
            routes = info.routes.len(),
            "Plugin enabled"
        );
        self.emit(
            PLUGIN_ENABLED,
            json!({ "plugin_id": id, "version": info.version }),
        )
        .await;

        Ok(info)
    }

    /// Undoes an initialized instance after a later enable step failed.
    async fn abort_enable(&self, id: &str, instance: &Arc<dyn Plugin>) {
        run_cleanup(id, instance).await;
        self.bus.unsubscribe_subscriber(id).await;
        self.mark_error(id).await;
    }

    async fn mark_error(&self, id: &str) {
        self.states.transition(id, PluginState::Error);
        if let Err(e) = self.store.set_status(id, PluginStatus::Error, Utc::now()).await {
            warn!(plugin_id = %id, error = %e, "Failed to persist error status");
        }
    }

    // ── Disable ──

    /// Tears down a loaded plugin and persists it as disabled.
    pub async fn disable(&self, plugin_id: &str) -> Result<(), PluginError> {
        let _guard = self.locks.acquire(plugin_id).await;
        self.disable_locked(plugin_id, true).await
    }

    /// Teardown order: cleanup, routes, hooks, bus subscriptions, registry.
    /// With `persist` unset the stored status is left alone, so the plugin
    /// comes back on the next restore.
    async fn disable_locked(&self, id: &str, persist: bool) -> Result<(), PluginError> {
        let Some(loaded) = self.registry.get(id).await else {
            return Err(PluginError::NotLoaded(id.to_string()));
        };

        self.states.transition(id, PluginState::Deactivating);
        run_cleanup(id, &loaded.instance).await;

        let routes_removed = self.routes.unmount(id).await;
        let hooks_removed = self.dispatcher.registry().unregister_plugin(id).await;
        let subscriptions_removed = self.bus.unsubscribe_subscriber(id).await;
        self.registry.remove(id).await;
        self.states.transition(id, PluginState::Disabled);

        debug!(
            plugin_id = %id,
            routes_removed,
            hooks_removed,
            subscriptions_removed,
            "Plugin torn down"
        );

        if persist {
            self.store
                .set_status(id, PluginStatus::Disabled, Utc::now())
                .await
                .map_err(|e| PluginError::persistence(id, e))?;
            info!(plugin_id = %id, "Plugin disabled");
            self.emit(PLUGIN_DISABLED, json!({ "plugin_id": id })).await;
        }
        Ok(())
    }

    /// Disables then re-enables a plugin with its current record.
    pub async fn reload(&self, plugin_id: &str) -> Result<PluginInfo, PluginError> {
        let _guard = self.locks.acquire(plugin_id).await;
        self.disable_locked(plugin_id, true).await?;
        self.enable_locked(plugin_id).await
    }

    // ── Uninstall ──

    /// Removes a plugin's files and record. Unknown IDs are a no-op.
    pub async fn uninstall(&self, plugin_id: &str) -> Result<(), PluginError> {
        let _guard = self.locks.acquire(plugin_id).await;

        if self.registry.contains(plugin_id).await {
            self.disable_locked(plugin_id, true).await?;
        }

        let record = self
            .store
            .get(plugin_id)
            .await
            .map_err(|e| PluginError::persistence(plugin_id, e))?;
        if record.is_none() {
            debug!(plugin_id = %plugin_id, "Uninstall of unknown plugin ignored");
            return Ok(());
        }

        let previous = self.states.transition(plugin_id, PluginState::Uninstalling);
        match tokio::fs::remove_dir_all(self.plugin_dir(plugin_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                if let Some(previous) = previous {
                    self.states.transition(plugin_id, previous);
                }
                return Err(PluginError::Operation {
                    plugin_id: plugin_id.to_string(),
                    operation: "uninstall",
                    source,
                });
            }
        }

        self.store
            .delete(plugin_id)
            .await
            .map_err(|e| PluginError::persistence(plugin_id, e))?;
        self.cache.clear_plugin(plugin_id).await;
        self.states.transition(plugin_id, PluginState::Removed);

        info!(plugin_id = %plugin_id, "Plugin uninstalled");
        self.emit(PLUGIN_UNINSTALLED, json!({ "plugin_id": plugin_id }))
            .await;
        Ok(())
    }

    // ── Configuration ──

    /// Merges `patch` over the stored configuration, validates the result
    /// against the manifest schema and persists it. A loaded plugin is
    /// reloaded so it sees the new values.
    ///
    /// Returns the stored configuration (without defaults).
    pub async fn update_config(&self, plugin_id: &str, patch: Value) -> Result<Value, PluginError> {
        if !patch.is_object() {
            return Err(PluginError::ConfigValidation {
                plugin_id: plugin_id.to_string(),
                missing: Vec::new(),
                invalid: vec!["config".to_string()],
            });
        }

        let _guard = self.locks.acquire(plugin_id).await;
        let record = self
            .store
            .get(plugin_id)
            .await
            .map_err(|e| PluginError::persistence(plugin_id, e))?
            .ok_or_else(|| PluginError::NotInstalled(plugin_id.to_string()))?;

        let stored = overlay(&record.config, &patch);
        let effective = overlay(&record.manifest.config.defaults, &stored);
        validate_config(&record.manifest.config.schema, &effective).map_err(|violations| {
            PluginError::ConfigValidation {
                plugin_id: plugin_id.to_string(),
                missing: violations.missing,
                invalid: violations.invalid,
            }
        })?;

        self.store
            .set_config(plugin_id, stored.clone())
            .await
            .map_err(|e| PluginError::persistence(plugin_id, e))?;
        info!(plugin_id = %plugin_id, "Plugin configuration updated");
        self.emit(
            PLUGIN_CONFIG_UPDATED,
            json!({ "plugin_id": plugin_id, "config": stored }),
        )
        .await;

        if self.registry.contains(plugin_id).await {
            self.disable_locked(plugin_id, true).await?;
            self.enable_locked(plugin_id).await?;
        }
        Ok(stored)
    }

    // ── Hooks ──

    /// Fires a hook and returns the successful handler results in order.
    pub async fn execute_hook(&self, hook: &str, data: Value) -> Vec<HookOutcome> {
        self.dispatcher.execute(hook, data).await
    }

    // ── Queries ──

    /// Every persisted record.
    pub async fn get_all_plugins(&self) -> AppResult<Vec<PluginRecord>> {
        self.store.list().await
    }

    /// Every loaded plugin.
    pub async fn get_active_plugins(&self) -> Vec<PluginInfo> {
        self.registry.list().await
    }

    /// One persisted record.
    pub async fn get_plugin(&self, plugin_id: &str) -> AppResult<Option<PluginRecord>> {
        self.store.get(plugin_id).await
    }

    /// Whether a plugin is loaded.
    pub async fn is_enabled(&self, plugin_id: &str) -> bool {
        self.registry.contains(plugin_id).await
    }

    /// Current lifecycle state of a plugin.
    pub fn state_of(&self, plugin_id: &str) -> Option<PluginState> {
        self.states.get(plugin_id)
    }

    /// Mounted plugin routes.
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Hook registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        self.dispatcher.registry()
    }

    /// Event bus shared with plugins.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Startup / shutdown ──

    /// Reads every `plugin.json` under the plugin directory.
    ///
    /// Unparseable manifests are logged and skipped.
    pub async fn discover(&self) -> AppResult<Vec<PluginManifest>> {
        let dir = self.loader.plugin_dir();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AppError::storage(format!(
                    "Failed to read plugin directory '{}': {e}",
                    dir.display()
                )));
            }
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::storage(format!("Failed to scan plugin directory: {e}")))?
        {
            let path = entry.path().join(MANIFEST_FILE);
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(_) => continue,
            };
            match PluginManifest::from_json(&text) {
                Ok(manifest) => {
                    self.states.observe(manifest.id(), PluginState::Discovered);
                    manifests.push(manifest);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                }
            }
        }

        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = manifests.len(), "Plugin discovery complete");
        Ok(manifests)
    }

    /// Re-enables every plugin persisted as enabled. Returns how many came
    /// back; failures are logged per plugin.
    pub async fn restore(&self) -> AppResult<usize> {
        let records = self.store.list().await?;
        let mut restored = 0;

        for record in records {
            match record.status {
                PluginStatus::Enabled => match self.enable(&record.id).await {
                    Ok(_) => restored += 1,
                    Err(e) => {
                        error!(plugin_id = %record.id, error = %e, "Failed to restore plugin");
                    }
                },
                status => {
                    let state = match status {
                        PluginStatus::Disabled => PluginState::Disabled,
                        PluginStatus::Error => PluginState::Error,
                        _ => PluginState::Installed,
                    };
                    self.states.observe(&record.id, state);
                }
            }
        }

        info!(restored, "Plugin restore complete");
        Ok(restored)
    }

    /// Tears down every loaded plugin without touching persisted status.
    pub async fn shutdown(&self) {
        for id in self.registry.ids().await {
            let _guard = self.locks.acquire(&id).await;
            if let Err(e) = self.disable_locked(&id, false).await {
                error!(plugin_id = %id, error = %e, "Error unloading plugin");
            }
        }
        info!("All plugins unloaded");
    }

    async fn emit(&self, event_type: &str, payload: Value) {
        if let Err(e) = self
            .bus
            .publish(event_type, MANAGER_SOURCE, payload, None)
            .await
        {
            warn!(event_type = %event_type, error = %e, "Failed to publish lifecycle event");
        }
    }
}

async fn run_cleanup(id: &str, instance: &Arc<dyn Plugin>) {
    match AssertUnwindSafe(instance.cleanup()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(message)) => {
            warn!(plugin_id = %id, error = %message, "Plugin cleanup returned error");
        }
        Err(_) => {
            warn!(plugin_id = %id, "Plugin cleanup panicked");
        }
    }
}
