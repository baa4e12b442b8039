//! Plugin install, list, and uninstall commands.

use std::path::{Path, PathBuf};

use clap::Args;
use keystone_core::error::{AppError, ErrorKind};
use keystone_plugin::PluginRecord;
use keystone_plugin::manifest::MANIFEST_FILE;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

/// Arguments for `keystone install`
#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Manifest file or plugin directory
    pub path: PathBuf,
}

/// Arguments for `keystone uninstall`
#[derive(Debug, Args)]
pub struct UninstallArgs {
    /// Plugin ID
    pub id: String,
}

/// Plugin row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct PluginRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Version")]
    pub version: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Hooks")]
    pub hooks: usize,
    #[tabled(rename = "Routes")]
    pub routes: usize,
    #[tabled(rename = "Updated")]
    pub updated_at: String,
}

impl From<&PluginRecord> for PluginRow {
    fn from(record: &PluginRecord) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version.clone(),
            status: record.status.to_string(),
            hooks: record.manifest.hooks.len(),
            routes: record.manifest.routes.len(),
            updated_at: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

/// Install a plugin. When given a directory, its other files (such as a
/// shared library entrypoint) are copied next to the stored manifest.
pub async fn install(
    args: &InstallArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let manifest = super::read_manifest(&args.path).await?;
    let runtime = super::Runtime::open(config_path).await?;

    let result = runtime.manager.install(manifest).await;
    let outcome = match result {
        Ok(record) => {
            if args.path.is_dir() {
                let target = Path::new(&runtime.config.plugins.directory).join(&record.id);
                copy_plugin_files(&args.path, &target).await?;
            }
            output::print_success(&format!(
                "Installed plugin '{}' v{}",
                record.id, record.version
            ));
            output::print_list(&[PluginRow::from(&record)], format);
            Ok(())
        }
        Err(e) => Err(AppError::from(e)),
    };

    runtime.close().await;
    outcome
}

/// List installed plugins
pub async fn list(config_path: &str, format: OutputFormat) -> Result<(), AppError> {
    let runtime = super::Runtime::open(config_path).await?;
    let records = runtime.manager.get_all_plugins().await;
    runtime.close().await;

    let rows: Vec<PluginRow> = records?.iter().map(PluginRow::from).collect();
    output::print_list(&rows, format);
    Ok(())
}

/// Uninstall a plugin
pub async fn uninstall(args: &UninstallArgs, config_path: &str) -> Result<(), AppError> {
    let runtime = super::Runtime::open(config_path).await?;

    let outcome = match runtime.manager.get_plugin(&args.id).await {
        Ok(None) => {
            output::print_warning(&format!("Plugin '{}' is not installed", args.id));
            Ok(())
        }
        Ok(Some(_)) => runtime
            .manager
            .uninstall(&args.id)
            .await
            .map(|()| output::print_success(&format!("Uninstalled plugin '{}'", args.id)))
            .map_err(AppError::from),
        Err(e) => Err(e),
    };

    runtime.close().await;
    outcome
}

async fn copy_plugin_files(source: &Path, target: &Path) -> Result<(), AppError> {
    let io_error = |e: std::io::Error| {
        AppError::with_source(ErrorKind::Storage, "Failed to copy plugin files", e)
    };

    let mut entries = tokio::fs::read_dir(source).await.map_err(io_error)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let file_type = entry.file_type().await.map_err(io_error)?;
        if !file_type.is_file() || entry.file_name() == MANIFEST_FILE {
            continue;
        }
        tokio::fs::copy(entry.path(), target.join(entry.file_name()))
            .await
            .map_err(io_error)?;
    }
    Ok(())
}
