//! Capability bundle handed to a plugin on enable.

use std::sync::Arc;
use std::time::Duration;

use keystone_events::{
    BusError, Event, EventBus, EventFilter, EventHandler, EventMetadata, SubscribeOptions,
    SubscriptionId,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::auth::Authorizer;
use super::services::PluginCacheService;

/// Context passed to a plugin's initialize routine.
///
/// Built fresh on every enable and bound to one plugin ID; never shared
/// between plugins.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    config: Arc<Value>,
    logger: PluginLogger,
    events: PluginEvents,
    cache: Arc<dyn PluginCacheService>,
    authorizer: Arc<dyn Authorizer>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("config", &self.config)
            .finish()
    }
}

impl PluginContext {
    /// Creates a context for `plugin_id` with its effective configuration.
    pub fn new(
        plugin_id: &str,
        config: Value,
        bus: EventBus,
        cache: Arc<dyn PluginCacheService>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            config: Arc::new(config),
            logger: PluginLogger::new(plugin_id),
            events: PluginEvents::new(bus, plugin_id),
            cache,
            authorizer,
        }
    }

    /// The plugin ID this context is bound to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Effective configuration (stored values over manifest defaults).
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// A single configuration value.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Deserializes the configuration into a typed struct.
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.config.as_ref())
    }

    /// Logger scoped to this plugin.
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Event bus access bound to this plugin.
    pub fn events(&self) -> &PluginEvents {
        &self.events
    }

    /// Cache scoped to this plugin.
    pub fn cache(&self) -> &Arc<dyn PluginCacheService> {
        &self.cache
    }

    /// Host authorizer.
    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }
}

/// Structured logger that tags every record with the plugin ID.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
    scope: Option<String>,
}

impl PluginLogger {
    /// Logger for `plugin_id` without a scope.
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            scope: None,
        }
    }

    /// A child logger; scopes nest as `parent.child`.
    pub fn child(&self, scope: &str) -> Self {
        let scope = match &self.scope {
            Some(parent) => format!("{parent}.{scope}"),
            None => scope.to_string(),
        };
        Self {
            plugin_id: self.plugin_id.clone(),
            scope: Some(scope),
        }
    }

    /// The current scope, if any.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn scope_field(&self) -> &str {
        self.scope.as_deref().unwrap_or("-")
    }

    /// Logs at debug level.
    pub fn debug(&self, message: &str) {
        debug!(plugin_id = %self.plugin_id, scope = %self.scope_field(), "{message}");
    }

    /// Logs at info level.
    pub fn info(&self, message: &str) {
        info!(plugin_id = %self.plugin_id, scope = %self.scope_field(), "{message}");
    }

    /// Logs at warn level.
    pub fn warn(&self, message: &str) {
        warn!(plugin_id = %self.plugin_id, scope = %self.scope_field(), "{message}");
    }

    /// Logs at error level.
    pub fn error(&self, message: &str) {
        error!(plugin_id = %self.plugin_id, scope = %self.scope_field(), "{message}");
    }
}

/// Event bus handle bound to a plugin.
///
/// Published events carry the plugin ID as their source. Subscriptions are
/// registered under the plugin ID so that disabling the plugin drops them.
#[derive(Debug, Clone)]
pub struct PluginEvents {
    bus: EventBus,
    plugin_id: String,
}

impl PluginEvents {
    /// Binds `bus` to `plugin_id`.
    pub fn new(bus: EventBus, plugin_id: &str) -> Self {
        Self {
            bus,
            plugin_id: plugin_id.to_string(),
        }
    }

    /// Publishes an event with this plugin as source.
    pub async fn publish(&self, event_type: &str, payload: Value) -> Result<Event, BusError> {
        self.bus
            .publish(event_type, self.plugin_id.as_str(), payload, None)
            .await
    }

    /// Publishes an event with metadata.
    pub async fn publish_with_metadata(
        &self,
        event_type: &str,
        payload: Value,
        metadata: EventMetadata,
    ) -> Result<Event, BusError> {
        self.bus
            .publish(event_type, self.plugin_id.as_str(), payload, Some(metadata))
            .await
    }

    /// Subscribes a handler; the subscriber label is always this plugin's ID.
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let options = options.subscriber(self.plugin_id.as_str());
        self.bus.subscribe(event_type, handler, options).await
    }

    /// Removes one of this plugin's subscriptions.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id).await
    }

    /// Waits for the next matching event.
    pub async fn wait_for(
        &self,
        event_type: &str,
        timeout: Duration,
        filter: Option<EventFilter>,
    ) -> Result<Event, BusError> {
        self.bus.wait_for(event_type, timeout, filter).await
    }
}
