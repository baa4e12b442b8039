//! Plugin configuration commands.

use clap::{Args, Subcommand};
use keystone_core::error::AppError;
use keystone_plugin::manifest::config::overlay;
use serde_json::Value;

use crate::output::{self, OutputFormat};

/// Arguments for `keystone config`
#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Configuration subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Merge a JSON object into a plugin's stored configuration
    Set {
        /// Plugin ID
        id: String,
        /// JSON object; `null` values remove keys
        json: String,
    },
    /// Show a plugin's effective configuration (defaults plus stored values)
    Show {
        /// Plugin ID
        id: String,
    },
}

/// Execute config command
pub async fn execute(
    args: &ConfigArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    match &args.command {
        ConfigCommand::Set { id, json } => set(id, json, config_path, format).await,
        ConfigCommand::Show { id } => show(id, config_path, format).await,
    }
}

async fn set(id: &str, json: &str, config_path: &str, format: OutputFormat) -> Result<(), AppError> {
    let patch: Value = serde_json::from_str(json)
        .map_err(|e| AppError::validation(format!("Configuration is not valid JSON: {e}")))?;

    let runtime = super::Runtime::open(config_path).await?;
    let result = runtime.manager.update_config(id, patch).await;
    runtime.close().await;

    let stored = result?;
    output::print_success(&format!("Configuration for '{id}' updated"));
    output::print_value(&stored, format);
    Ok(())
}

async fn show(id: &str, config_path: &str, format: OutputFormat) -> Result<(), AppError> {
    let runtime = super::Runtime::open(config_path).await?;
    let record = runtime.manager.get_plugin(id).await;
    runtime.close().await;

    let record = record?.ok_or_else(|| AppError::not_found(format!("Plugin '{id}' is not installed")))?;
    let effective = overlay(&record.manifest.config.defaults, &record.config);
    output::print_value(&effective, format);
    Ok(())
}
