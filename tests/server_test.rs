//! End-to-end tests for the host router.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use keystone::app::{AppState, build_router};
use keystone_core::config::{EventBusConfig, PluginConfig};
use keystone_events::EventBus;
use keystone_plugin::manifest::RouteDeclaration;
use keystone_plugin::{
    MemoryPluginStore, Plugin, PluginCatalog, PluginContext, PluginManager, PluginManifest,
    RouteHandler, RouteRequest, RouteResponse, route_fn,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct Echo;

#[async_trait]
impl Plugin for Echo {
    async fn initialize(&self, _ctx: &PluginContext) -> Result<(), String> {
        Ok(())
    }

    fn route_handler(&self, name: &str) -> Option<Arc<dyn RouteHandler>> {
        (name == "echo").then(|| {
            route_fn(|req: RouteRequest| async move {
                let body: Value = req.json().map_err(|e| e.to_string())?;
                Ok(RouteResponse::ok(body))
            })
        })
    }
}

fn echo_manifest() -> PluginManifest {
    PluginManifest {
        name: "echo".to_string(),
        version: "1.0.0".to_string(),
        entrypoint: "builtin:echo".to_string(),
        routes: vec![RouteDeclaration {
            path: "/echo".to_string(),
            method: "POST".to_string(),
            handler: "echo".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn setup(body_limit: usize) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = PluginConfig {
        directory: dir.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    let catalog = PluginCatalog::new().with("echo", || Arc::new(Echo) as Arc<dyn Plugin>);
    let manager = PluginManager::new(
        config,
        Arc::new(MemoryPluginStore::new()),
        EventBus::new(EventBusConfig::default()),
        catalog,
    )
    .with_body_limit(body_limit);

    (
        AppState {
            manager: Arc::new(manager),
        },
        dir,
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_active_plugins() {
    let (state, _dir) = setup(1024 * 1024);
    let app = build_router(state.clone(), 1024 * 1024);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["plugins"]["active"], 0);

    state.manager.install(echo_manifest()).await.unwrap();
    state.manager.enable("echo").await.unwrap();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["plugins"]["ids"], json!(["echo"]));
}

#[tokio::test]
async fn test_plugin_routes_follow_lifecycle() {
    let (state, _dir) = setup(1024 * 1024);
    let app = build_router(state.clone(), 1024 * 1024);

    let response = app
        .clone()
        .oneshot(post("/api/plugins/echo/echo", r#"{"n":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    state.manager.install(echo_manifest()).await.unwrap();
    state.manager.enable("echo").await.unwrap();

    let response = app
        .clone()
        .oneshot(post("/plugins/echo/echo", r#"{"n":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"n": 1}));

    state.manager.disable("echo").await.unwrap();
    let response = app
        .oneshot(post("/api/plugins/echo/echo", r#"{"n":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let (state, _dir) = setup(16);
    state.manager.install(echo_manifest()).await.unwrap();
    state.manager.enable("echo").await.unwrap();
    let app = build_router(state, 16);

    let response = app
        .oneshot(post("/api/plugins/echo/echo", r#"{"payload":"far too long for the limit"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
