//! Keystone Server: plugin host.
//!
//! Main entry point that wires the crates together and starts the server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keystone::app::{AppState, build_router};
use keystone_core::config::AppConfig;
use keystone_core::error::AppError;
use keystone_core::logging;
use keystone_events::{EventBus, FileEventStore};
use keystone_plugin::{FilePluginStore, HeaderPermissionAuthorizer, PluginCatalog, PluginManager};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

/// Load configuration from file and environment.
///
/// `KEYSTONE_CONFIG` names an explicit file; otherwise `config/default.toml`
/// is merged with `config/{KEYSTONE_ENV}.toml`.
fn load_configuration() -> Result<AppConfig, AppError> {
    match std::env::var("KEYSTONE_CONFIG") {
        Ok(path) => AppConfig::load_from(&path),
        Err(_) => {
            let env = std::env::var("KEYSTONE_ENV").unwrap_or_else(|_| "development".to_string());
            AppConfig::load(&env)
        }
    }
}

/// Plugins compiled into this binary. Shared-library plugins are loaded from
/// the plugin directory when the `dynamic` feature is enabled.
fn builtin_catalog() -> PluginCatalog {
    PluginCatalog::new()
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Keystone");

    // ── Storage ──
    create_data_directories(&config).await?;

    // ── Event bus ──
    let event_store = Arc::new(FileEventStore::new(config.events.log_path.clone()));
    let bus = EventBus::with_store(config.events.clone(), event_store);
    bus.start();

    // ── Plugins ──
    let store = Arc::new(FilePluginStore::open(config.plugins.store_path.clone()).await?);
    let manager = Arc::new(
        PluginManager::new(config.plugins.clone(), store, bus.clone(), builtin_catalog())
            .with_authorizer(Arc::new(HeaderPermissionAuthorizer::new()))
            .with_body_limit(config.server.body_limit_bytes),
    );

    let discovered = manager.discover().await?;
    tracing::info!(count = discovered.len(), "Plugin directory scanned");

    if config.plugins.auto_restore {
        let restored = manager.restore().await?;
        tracing::info!(count = restored, "Enabled plugins restored");
    }

    // ── HTTP server ──
    let app = build_router(
        AppState {
            manager: Arc::clone(&manager),
        },
        config.server.body_limit_bytes,
    );

    let addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::internal(format!("Failed to bind {addr}: {e}")))?;

    tracing::info!(address = %addr, "Keystone server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
        })
        .await
        .map_err(|e| AppError::internal(format!("Server error: {e}")))?;

    // ── Teardown ──
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    let teardown = async {
        manager.shutdown().await;
        bus.shutdown().await;
    };
    if tokio::time::timeout(grace, teardown).await.is_err() {
        tracing::warn!(grace_seconds = grace.as_secs(), "Shutdown grace period elapsed");
    }

    tracing::info!("Keystone server shut down gracefully");
    Ok(())
}

/// Create required data directories
async fn create_data_directories(config: &AppConfig) -> Result<(), AppError> {
    let mut dirs = vec![Path::new(&config.plugins.directory)];
    for file in [&config.plugins.store_path, &config.events.log_path] {
        if let Some(parent) = Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                dirs.push(parent);
            }
        }
    }

    for dir in dirs {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            AppError::internal(format!("Failed to create dir '{}': {e}", dir.display()))
        })?;
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
