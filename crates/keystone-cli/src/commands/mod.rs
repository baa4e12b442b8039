//! CLI command definitions and dispatch.

pub mod config;
pub mod events;
pub mod plugins;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use keystone_core::config::AppConfig;
use keystone_core::error::AppError;
use keystone_events::{EventBus, FileEventStore};
use keystone_plugin::manifest::MANIFEST_FILE;
use keystone_plugin::{FilePluginStore, PluginCatalog, PluginManager, PluginManifest};

use crate::output::OutputFormat;

/// Keystone plugin administration
#[derive(Debug, Parser)]
#[command(name = "keystone", version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate a plugin manifest without installing it
    Validate(validate::ValidateArgs),
    /// Install a plugin from a manifest file or plugin directory
    Install(plugins::InstallArgs),
    /// List installed plugins
    List,
    /// Uninstall a plugin
    Uninstall(plugins::UninstallArgs),
    /// Plugin configuration
    Config(config::ConfigArgs),
    /// Inspect the persisted event log
    Events(events::EventsArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<(), AppError> {
        match &self.command {
            Commands::Validate(args) => validate::execute(args, self.format).await,
            Commands::Install(args) => plugins::install(args, &self.config, self.format).await,
            Commands::List => plugins::list(&self.config, self.format).await,
            Commands::Uninstall(args) => plugins::uninstall(args, &self.config).await,
            Commands::Config(args) => config::execute(args, &self.config, self.format).await,
            Commands::Events(args) => events::execute(args, &self.config, self.format).await,
        }
    }
}

/// Helper: load configuration from file
pub fn load_config(config_path: &str) -> Result<AppConfig, AppError> {
    AppConfig::load_from(config_path)
}

/// Stores and manager opened against the configured data files.
///
/// No plugin is instantiated; lifecycle calls only touch records, the
/// plugin directory, and the event log.
pub struct Runtime {
    pub config: AppConfig,
    pub manager: PluginManager,
    pub events: Arc<FileEventStore>,
}

impl Runtime {
    /// Open the runtime described by the configuration file.
    pub async fn open(config_path: &str) -> Result<Self, AppError> {
        let config = load_config(config_path)?;
        let events = Arc::new(FileEventStore::new(config.events.log_path.clone()));
        let bus = EventBus::with_store(config.events.clone(), events.clone());
        let store = Arc::new(FilePluginStore::open(config.plugins.store_path.clone()).await?);
        let manager = PluginManager::new(config.plugins.clone(), store, bus, PluginCatalog::new());

        Ok(Self {
            config,
            manager,
            events,
        })
    }

    /// Drain queued events into the log and stop the bus.
    pub async fn close(self) {
        self.manager.bus().shutdown().await;
    }
}

/// Resolve a manifest path: directories are searched for `plugin.json`.
pub fn manifest_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MANIFEST_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Helper: read and parse a manifest file
pub async fn read_manifest(path: &Path) -> Result<PluginManifest, AppError> {
    let path = manifest_path(path);
    let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
        AppError::with_source(
            keystone_core::error::ErrorKind::Validation,
            format!("Failed to read manifest '{}'", path.display()),
            e,
        )
    })?;
    PluginManifest::from_json(&text).map_err(|e| {
        AppError::validation(format!("Malformed manifest '{}': {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from(["keystone", "-c", "custom.toml", "-f", "json", "list"])
            .unwrap();
        assert_eq!(cli.config, "custom.toml");
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_parse_config_set() {
        let cli =
            Cli::try_parse_from(["keystone", "config", "set", "reports", r#"{"limit":5}"#]).unwrap();
        match cli.command {
            Commands::Config(args) => match args.command {
                config::ConfigCommand::Set { id, json } => {
                    assert_eq!(id, "reports");
                    assert_eq!(json, r#"{"limit":5}"#);
                }
                other => panic!("unexpected command: {other:?}"),
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_manifest_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name":"reports","version":"1.0.0","entrypoint":"builtin:reports"}"#,
        )
        .unwrap();

        let manifest = read_manifest(dir.path()).await.unwrap();
        assert_eq!(manifest.id(), "reports");
        assert_eq!(manifest.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_read_manifest_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = read_manifest(&path).await.unwrap_err();
        assert_eq!(err.kind, keystone_core::error::ErrorKind::Validation);
    }
}
