//! Manifest validation command.

use std::path::PathBuf;

use clap::Args;
use keystone_core::error::AppError;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

/// Arguments for `keystone validate`
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Manifest file or plugin directory
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Tabled)]
struct ViolationRow {
    #[tabled(rename = "Field")]
    field: String,
    #[tabled(rename = "Problem")]
    message: String,
}

/// Execute validate command
pub async fn execute(args: &ValidateArgs, format: OutputFormat) -> Result<(), AppError> {
    let manifest = super::read_manifest(&args.path).await?;

    match keystone_plugin::validate(&manifest) {
        Ok(()) => {
            output::print_success(&format!(
                "Manifest for '{}' v{} is valid",
                manifest.id(),
                manifest.version
            ));
            Ok(())
        }
        Err(e) => {
            let rows: Vec<ViolationRow> = e
                .violations
                .iter()
                .map(|v| ViolationRow {
                    field: v.field.clone(),
                    message: v.message.clone(),
                })
                .collect();
            output::print_list(&rows, format);
            Err(AppError::validation(format!(
                "{} problem(s) found in manifest",
                rows.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        std::fs::write(&path, r#"{"name":"Bad Name","version":"one"}"#).unwrap();

        let args = ValidateArgs { path };
        let err = execute(&args, OutputFormat::Json).await.unwrap_err();
        assert_eq!(err.kind, keystone_core::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_valid_manifest_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            r#"{"name":"reports","version":"1.2.0","entrypoint":"builtin:reports"}"#,
        )
        .unwrap();

        let args = ValidateArgs {
            path: dir.path().to_path_buf(),
        };
        assert!(execute(&args, OutputFormat::Table).await.is_ok());
    }
}
