//! Resolves a manifest entrypoint to a live plugin instance.
//!
//! `builtin:<name>` entrypoints come from a [`PluginCatalog`] registered by
//! the host. Any other entrypoint is a shared library inside the plugin's
//! directory, loaded through `libloading` when the `dynamic` feature is on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::manifest::PluginManifest;
use crate::registry::Plugin;

/// Entrypoint prefix for plugins compiled into the host.
pub const BUILTIN_PREFIX: &str = "builtin:";

type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Named factories for built-in plugins.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, PluginFactory>,
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory; each enable gets a fresh instance.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Builder-style [`Self::register`].
    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Instantiates a built-in plugin.
    pub fn create(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Registered names.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Loads plugin instances for manifests.
#[derive(Debug)]
pub struct PluginLoader {
    plugin_dir: PathBuf,
    catalog: PluginCatalog,
    dynamic: DynamicLoader,
}

impl PluginLoader {
    /// Creates a loader rooted at the plugin directory.
    pub fn new(plugin_dir: impl Into<PathBuf>, catalog: PluginCatalog) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            catalog,
            dynamic: DynamicLoader::new(),
        }
    }

    /// The plugin directory.
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Instantiates the plugin a manifest points at.
    pub fn load(&self, manifest: &PluginManifest) -> Result<Arc<dyn Plugin>, String> {
        if let Some(name) = manifest.entrypoint.strip_prefix(BUILTIN_PREFIX) {
            let plugin = self
                .catalog
                .create(name)
                .ok_or_else(|| format!("no built-in plugin named '{name}'"))?;
            info!(plugin_id = %manifest.id(), entrypoint = %manifest.entrypoint, "Built-in plugin instantiated");
            return Ok(plugin);
        }

        let path = self
            .plugin_dir
            .join(manifest.id())
            .join(&manifest.entrypoint);
        self.dynamic.load(&path)
    }
}

#[cfg(feature = "dynamic")]
mod dynamic_loader {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use tracing::info;

    use crate::registry::Plugin;

    /// Symbol every dynamic plugin must export.
    pub const CREATE_SYMBOL: &[u8] = b"keystone_plugin_create";

    /// Signature of [`CREATE_SYMBOL`]. The returned pointer is a
    /// `Box<Box<dyn Plugin>>` leaked with `Box::into_raw`.
    pub type CreatePluginFn = unsafe extern "C" fn() -> *mut Box<dyn Plugin>;

    /// Loads plugins from shared libraries (.so / .dll / .dylib).
    ///
    /// One handle is retained per library path for the life of the loader.
    /// Reloading a path replaces its handle; the OS keeps the library mapped
    /// because the new handle holds a reference before the old one is dropped.
    pub struct DynamicLoader {
        libraries: Mutex<HashMap<PathBuf, libloading::Library>>,
    }

    impl DynamicLoader {
        pub fn new() -> Self {
            Self {
                libraries: Mutex::new(HashMap::new()),
            }
        }

        /// Number of retained library handles.
        pub fn retained(&self) -> usize {
            self.libraries.lock().map(|l| l.len()).unwrap_or(0)
        }

        /// Loads a plugin from a shared library. Only trusted libraries
        /// may be placed in the plugin directory.
        pub fn load(&self, path: &Path) -> Result<Arc<dyn Plugin>, String> {
            // SAFETY: running library initializers is inherent to plugin loading.
            let library = unsafe { libloading::Library::new(path) }
                .map_err(|e| format!("failed to load '{}': {e}", path.display()))?;

            let plugin = {
                // SAFETY: the symbol type is fixed by the plugin ABI above.
                let create: libloading::Symbol<CreatePluginFn> = unsafe { library.get(CREATE_SYMBOL) }
                    .map_err(|e| format!("'{}' does not export keystone_plugin_create: {e}", path.display()))?;
                // SAFETY: the factory hands over ownership of a boxed plugin.
                let raw = unsafe { create() };
                if raw.is_null() {
                    return Err(format!("'{}' returned a null plugin", path.display()));
                }
                // SAFETY: non-null pointers come from Box::into_raw in the library.
                let boxed = unsafe { Box::from_raw(raw) };
                Arc::from(*boxed)
            };

            info!(path = %path.display(), "Dynamic plugin loaded");
            if let Ok(mut libraries) = self.libraries.lock() {
                libraries.insert(path.to_path_buf(), library);
            } else {
                std::mem::forget(library);
            }
            Ok(plugin)
        }
    }

    impl std::fmt::Debug for DynamicLoader {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DynamicLoader")
                .field("loaded_count", &self.retained())
                .finish()
        }
    }
}

/// Loader used when the `dynamic` feature is off.
#[cfg(not(feature = "dynamic"))]
mod dynamic_loader {
    use std::path::Path;
    use std::sync::Arc;

    use crate::registry::Plugin;

    #[derive(Debug)]
    pub struct DynamicLoader;

    impl DynamicLoader {
        pub fn new() -> Self {
            Self
        }

        pub fn load(&self, path: &Path) -> Result<Arc<dyn Plugin>, String> {
            Err(format!(
                "cannot load '{}': dynamic loading not enabled",
                path.display()
            ))
        }
    }
}

use dynamic_loader::DynamicLoader;
