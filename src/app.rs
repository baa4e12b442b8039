//! Router and shared state for the Keystone server.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use keystone_plugin::PluginManager;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Plugin lifecycle manager; owns the route table and the event bus.
    pub manager: Arc<PluginManager>,
}

/// Builds the host router.
///
/// `/health` is served directly; every other request is dispatched through
/// the plugin route table, which is rebuilt on each mount and unmount.
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(dispatch_plugin_route)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active: Vec<String> = state
        .manager
        .get_active_plugins()
        .await
        .into_iter()
        .map(|info| info.id)
        .collect();
    let bus = state.manager.bus();
    let stats = bus.stats();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "plugins": {
            "active": active.len(),
            "ids": active,
        },
        "events": {
            "bus": bus.state(),
            "queued": bus.queue_len().await,
            "published": stats.total_events,
            "failed": stats.failed_events,
        },
    }))
}

async fn dispatch_plugin_route(State(state): State<AppState>, request: Request) -> Response {
    state.manager.routes().dispatch(request).await
}
