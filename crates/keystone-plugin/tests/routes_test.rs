//! HTTP tests for routes mounted by enabled plugins.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use keystone_core::config::{EventBusConfig, PluginConfig};
use keystone_events::EventBus;
use keystone_plugin::manifest::RouteDeclaration;
use keystone_plugin::{
    HeaderPermissionAuthorizer, MemoryPluginStore, Plugin, PluginCatalog, PluginContext,
    PluginManager, PluginManifest, RouteHandler, RouteRequest, RouteResponse, route_fn,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct Inventory;

#[async_trait]
impl Plugin for Inventory {
    async fn initialize(&self, ctx: &PluginContext) -> Result<(), String> {
        ctx.logger().child("routes").info("inventory ready");
        Ok(())
    }

    fn route_handler(&self, name: &str) -> Option<Arc<dyn RouteHandler>> {
        match name {
            "list" => Some(route_fn(|req: RouteRequest| async move {
                Ok(RouteResponse::ok(json!({
                    "items": [],
                    "page": req.query.get("page").cloned().unwrap_or_default(),
                })))
            })),
            "show" => Some(route_fn(|req: RouteRequest| async move {
                Ok(RouteResponse::ok(json!({ "id": req.param("id") })))
            })),
            "create" => Some(route_fn(|req: RouteRequest| async move {
                let body: Value = req.json().map_err(|e| e.to_string())?;
                Ok(RouteResponse::with_status(StatusCode::CREATED, body))
            })),
            "broken" => Some(route_fn(|_| async { Err("backend offline".to_string()) })),
            _ => None,
        }
    }
}

fn route(method: &str, path: &str, handler: &str, permissions: &[&str]) -> RouteDeclaration {
    RouteDeclaration {
        path: path.to_string(),
        method: method.to_string(),
        handler: handler.to_string(),
        middleware: Vec::new(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
    }
}

fn inventory_manifest() -> PluginManifest {
    PluginManifest {
        name: "inventory".to_string(),
        version: "0.3.0".to_string(),
        entrypoint: "builtin:inventory".to_string(),
        routes: vec![
            route("GET", "/items", "list", &[]),
            route("GET", "/items/{id}", "show", &[]),
            route("POST", "/items", "create", &["inventory:write"]),
            route("GET", "/broken", "broken", &[]),
        ],
        ..Default::default()
    }
}

async fn enabled_manager() -> (PluginManager, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = PluginConfig {
        directory: dir.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    let catalog =
        PluginCatalog::new().with("inventory", || Arc::new(Inventory) as Arc<dyn Plugin>);
    let manager = PluginManager::new(
        config,
        Arc::new(MemoryPluginStore::new()),
        EventBus::new(EventBusConfig::default()),
        catalog,
    )
    .with_authorizer(Arc::new(HeaderPermissionAuthorizer::new()));

    manager.install(inventory_manifest()).await.unwrap();
    manager.enable("inventory").await.unwrap();
    (manager, dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_routes_served_under_both_prefixes() {
    let (manager, _dir) = enabled_manager().await;
    let router = manager.routes().router().await;

    for uri in ["/api/plugins/inventory/items?page=2", "/plugins/inventory/items?page=2"] {
        let response = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"items": [], "page": "2"}));
    }
}

#[tokio::test]
async fn test_path_parameters() {
    let (manager, _dir) = enabled_manager().await;
    let response = manager
        .routes()
        .dispatch(get("/api/plugins/inventory/items/42"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"id": "42"}));
}

#[tokio::test]
async fn test_permissions_checked_before_handler() {
    let (manager, _dir) = enabled_manager().await;

    let denied = Request::builder()
        .method("POST")
        .uri("/api/plugins/inventory/items")
        .body(Body::from(r#"{"name":"bolt"}"#))
        .unwrap();
    let response = manager.routes().dispatch(denied).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "FORBIDDEN");

    let allowed = Request::builder()
        .method("POST")
        .uri("/plugins/inventory/items")
        .header("x-permissions", "inventory:*")
        .body(Body::from(r#"{"name":"bolt"}"#))
        .unwrap();
    let response = manager.routes().dispatch(allowed).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"name": "bolt"}));
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    let (manager, _dir) = enabled_manager().await;
    let response = manager
        .routes()
        .dispatch(get("/api/plugins/inventory/broken"))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["message"], "backend offline");
}

#[tokio::test]
async fn test_disable_unmounts_routes() {
    let (manager, _dir) = enabled_manager().await;
    manager.disable("inventory").await.unwrap();

    for uri in ["/api/plugins/inventory/items", "/plugins/inventory/items"] {
        let response = manager.routes().dispatch(get(uri)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    manager.enable("inventory").await.unwrap();
    let response = manager
        .routes()
        .dispatch(get("/plugins/inventory/items"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
