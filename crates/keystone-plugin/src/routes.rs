//! HTTP routes contributed by plugins.
//!
//! Each enabled plugin's routes are composed into one axum router that is
//! nested under both the primary prefix (`/api/plugins/{id}`) and the legacy
//! prefix (`/plugins/{id}`). Mounting is all-or-nothing per plugin.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::api::auth::Authorizer;
use crate::manifest::RouteDeclaration;

/// Request as seen by a plugin route handler.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// HTTP method.
    pub method: Method,
    /// Full request path, including the mount prefix.
    pub path: String,
    /// Path parameters captured by `{name}` segments.
    pub params: HashMap<String, String>,
    /// Query string parameters.
    pub query: HashMap<String, String>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw request body.
    pub body: Bytes,
}

impl RouteRequest {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// A path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Response produced by a plugin route handler.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    /// Status code.
    pub status: StatusCode,
    /// JSON body.
    pub body: Value,
}

impl RouteResponse {
    /// `200 OK` with a JSON body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    /// Custom status with a JSON body.
    pub fn with_status(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }
}

impl IntoResponse for RouteResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// A plugin route handler.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Handles one request.
    async fn handle(&self, request: RouteRequest) -> Result<RouteResponse, String>;
}

type BoxedRouteFn =
    Arc<dyn Fn(RouteRequest) -> BoxFuture<'static, Result<RouteResponse, String>> + Send + Sync>;

/// Adapter turning an async closure into a [`RouteHandler`].
pub struct FnRouteHandler {
    f: BoxedRouteFn,
}

#[async_trait]
impl RouteHandler for FnRouteHandler {
    async fn handle(&self, request: RouteRequest) -> Result<RouteResponse, String> {
        (self.f)(request).await
    }
}

/// Wraps an async closure as a route handler.
pub fn route_fn<F, Fut>(handler: F) -> Arc<dyn RouteHandler>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RouteResponse, String>> + Send + 'static,
{
    Arc::new(FnRouteHandler {
        f: Arc::new(move |request| Box::pin(handler(request))),
    })
}

#[derive(Debug, Serialize)]
struct RouteErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    let body = RouteErrorBody {
        error,
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

/// One declared route bound to its handler.
struct Endpoint {
    plugin_id: String,
    method: Method,
    path: String,
    permissions: Vec<String>,
    handler: Arc<dyn RouteHandler>,
    authorizer: Arc<dyn Authorizer>,
    body_limit: usize,
}

impl Endpoint {
    async fn call(&self, params: HashMap<String, String>, request: Request) -> Response {
        if !self.permissions.is_empty()
            && !self.authorizer.authorize(request.headers(), &self.permissions)
        {
            debug!(
                plugin_id = %self.plugin_id,
                path = %self.path,
                "Plugin route denied"
            );
            return error_response(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                format!("Missing permissions: {}", self.permissions.join(", ")),
            );
        }

        let (parts, body) = request.into_parts();
        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        let body = match axum::body::to_bytes(body, self.body_limit).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "PAYLOAD_TOO_LARGE",
                    e.to_string(),
                );
            }
        };

        let route_request = RouteRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            params,
            query,
            headers: parts.headers,
            body,
        };

        match AssertUnwindSafe(self.handler.handle(route_request))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response.into_response(),
            Ok(Err(message)) => {
                error!(
                    plugin_id = %self.plugin_id,
                    method = %self.method,
                    path = %self.path,
                    error = %message,
                    "Plugin route handler failed"
                );
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "PLUGIN_ERROR", message)
            }
            Err(_) => {
                error!(
                    plugin_id = %self.plugin_id,
                    method = %self.method,
                    path = %self.path,
                    "Plugin route handler panicked"
                );
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PLUGIN_ERROR",
                    "Plugin route handler panicked",
                )
            }
        }
    }
}

fn method_router(endpoint: Endpoint) -> Result<MethodRouter, String> {
    let filter = MethodFilter::try_from(endpoint.method.clone())
        .map_err(|e| format!("unsupported method '{}': {e}", endpoint.method))?;
    let endpoint = Arc::new(endpoint);

    let router = if endpoint.path.contains('{') {
        axum::routing::on(
            filter,
            move |Path(params): Path<HashMap<String, String>>, request: Request| {
                let endpoint = Arc::clone(&endpoint);
                async move { endpoint.call(params, request).await }
            },
        )
    } else {
        axum::routing::on(filter, move |request: Request| {
            let endpoint = Arc::clone(&endpoint);
            async move { endpoint.call(HashMap::new(), request).await }
        })
    };
    Ok(router)
}

/// Routes mounted for one plugin.
#[derive(Clone)]
struct MountedGroup {
    routes: Vec<String>,
    router: Router,
}

/// Every plugin route currently served.
pub struct RouteTable {
    primary_prefix: String,
    legacy_prefix: String,
    authorizer: Arc<dyn Authorizer>,
    body_limit: usize,
    groups: RwLock<BTreeMap<String, MountedGroup>>,
    router: RwLock<Router>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("primary_prefix", &self.primary_prefix)
            .field("legacy_prefix", &self.legacy_prefix)
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

impl RouteTable {
    /// Creates an empty table serving under the given prefixes.
    pub fn new(
        primary_prefix: &str,
        legacy_prefix: &str,
        authorizer: Arc<dyn Authorizer>,
        body_limit: usize,
    ) -> Self {
        Self {
            primary_prefix: primary_prefix.trim_end_matches('/').to_string(),
            legacy_prefix: legacy_prefix.trim_end_matches('/').to_string(),
            authorizer,
            body_limit,
            groups: RwLock::new(BTreeMap::new()),
            router: RwLock::new(Router::new()),
        }
    }

    /// The primary mount path for a plugin.
    pub fn primary_mount(&self, plugin_id: &str) -> String {
        format!("{}/{plugin_id}", self.primary_prefix)
    }

    /// The legacy mount path for a plugin.
    pub fn legacy_mount(&self, plugin_id: &str) -> String {
        format!("{}/{plugin_id}", self.legacy_prefix)
    }

    /// Mounts a plugin's routes under both prefixes.
    ///
    /// Nothing is served unless every route mounts.
    pub async fn mount(
        &self,
        plugin_id: &str,
        routes: Vec<(RouteDeclaration, Arc<dyn RouteHandler>)>,
    ) -> Result<(), String> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(plugin_id) {
            return Err(format!("routes for '{plugin_id}' are already mounted"));
        }

        let mut seen = HashSet::new();
        let mut by_path: BTreeMap<String, Vec<Endpoint>> = BTreeMap::new();
        let mut labels = Vec::with_capacity(routes.len());

        for (declaration, handler) in routes {
            let method = Method::from_bytes(declaration.method.to_uppercase().as_bytes())
                .map_err(|e| format!("invalid method '{}': {e}", declaration.method))?;
            let label = format!("{method} {}", declaration.path);
            if !seen.insert(label.clone()) {
                return Err(format!("duplicate route '{label}'"));
            }
            if !declaration.middleware.is_empty() {
                debug!(
                    plugin_id = %plugin_id,
                    route = %label,
                    middleware = ?declaration.middleware,
                    "Route middleware names are informational"
                );
            }
            labels.push(label);
            by_path
                .entry(declaration.path.clone())
                .or_default()
                .push(Endpoint {
                    plugin_id: plugin_id.to_string(),
                    method,
                    path: declaration.path,
                    permissions: declaration.permissions,
                    handler,
                    authorizer: Arc::clone(&self.authorizer),
                    body_limit: self.body_limit,
                });
        }

        let mut plugin_router = Router::new();
        for (path, endpoints) in by_path {
            let mut method_routers = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                method_routers.push(method_router(endpoint)?);
            }
            let router = plugin_router;
            let route_path = &path;
            plugin_router = std::panic::catch_unwind(AssertUnwindSafe(move || {
                match method_routers.into_iter().reduce(MethodRouter::merge) {
                    Some(combined) => router.route(route_path, combined),
                    None => router,
                }
            }))
            .map_err(|_| format!("route path '{path}' was rejected by the router"))?;
        }

        let primary = self.primary_mount(plugin_id);
        let legacy = self.legacy_mount(plugin_id);
        let group_router = if labels.is_empty() {
            Router::new()
        } else {
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                Router::new()
                    .nest(&primary, plugin_router.clone())
                    .nest(&legacy, plugin_router)
            }))
            .map_err(|_| format!("routes for '{plugin_id}' could not be nested"))?
        };

        let mut next_groups = groups.clone();
        next_groups.insert(
            plugin_id.to_string(),
            MountedGroup {
                routes: labels,
                router: group_router,
            },
        );
        let composed = compose(&next_groups)?;

        *self.router.write().await = composed;
        *groups = next_groups;

        info!(plugin_id = %plugin_id, primary = %primary, legacy = %legacy, "Plugin routes mounted");
        Ok(())
    }

    /// Removes a plugin's routes. Returns whether anything was mounted.
    pub async fn unmount(&self, plugin_id: &str) -> bool {
        let mut groups = self.groups.write().await;
        if groups.remove(plugin_id).is_none() {
            return false;
        }

        match compose(&groups) {
            Ok(router) => *self.router.write().await = router,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to rebuild plugin router");
                *self.router.write().await = Router::new();
            }
        }
        info!(plugin_id = %plugin_id, "Plugin routes unmounted");
        true
    }

    /// Whether a plugin has mounted routes.
    pub async fn is_mounted(&self, plugin_id: &str) -> bool {
        self.groups.read().await.contains_key(plugin_id)
    }

    /// Mounted routes of a plugin as `METHOD /path`.
    pub async fn routes_for(&self, plugin_id: &str) -> Vec<String> {
        self.groups
            .read()
            .await
            .get(plugin_id)
            .map(|g| g.routes.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the composed router.
    pub async fn router(&self) -> Router {
        self.router.read().await.clone()
    }

    /// Routes a request through the current plugin routes.
    ///
    /// Unknown paths produce `404 Not Found`.
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let router = self.router().await;
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

fn compose(groups: &BTreeMap<String, MountedGroup>) -> Result<Router, String> {
    std::panic::catch_unwind(AssertUnwindSafe(|| {
        groups
            .values()
            .fold(Router::new(), |router, group| router.merge(group.router.clone()))
    }))
    .map_err(|_| "plugin routes overlap".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::{AllowAllAuthorizer, HeaderPermissionAuthorizer};
    use axum::http::Request as HttpRequest;
    use serde_json::json;

    fn declaration(method: &str, path: &str, handler: &str) -> RouteDeclaration {
        RouteDeclaration {
            path: path.to_string(),
            method: method.to_string(),
            handler: handler.to_string(),
            ..Default::default()
        }
    }

    fn echo() -> Arc<dyn RouteHandler> {
        route_fn(|req: RouteRequest| async move { Ok(RouteResponse::ok(json!({"path": req.path}))) })
    }

    fn table() -> RouteTable {
        RouteTable::new("/api/plugins", "/plugins", Arc::new(AllowAllAuthorizer), 1024)
    }

    fn get(uri: &str) -> Request<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_route_rejected_without_mounting() {
        let table = table();
        let result = table
            .mount(
                "reports",
                vec![
                    (declaration("GET", "/a", "a"), echo()),
                    (declaration("get", "/a", "b"), echo()),
                ],
            )
            .await;
        assert!(result.is_err());
        assert!(!table.is_mounted("reports").await);
        let response = table.dispatch(get("/api/plugins/reports/a")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_same_path_different_methods() {
        let table = table();
        table
            .mount(
                "reports",
                vec![
                    (declaration("GET", "/items", "list"), echo()),
                    (declaration("POST", "/items", "create"), echo()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            table.routes_for("reports").await,
            vec!["GET /items".to_string(), "POST /items".to_string()]
        );

        let post = HttpRequest::builder()
            .method(Method::POST)
            .uri("/plugins/reports/items")
            .body(Body::empty())
            .unwrap();
        assert_eq!(table.dispatch(post).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_permissions_enforced() {
        let table = RouteTable::new(
            "/api/plugins",
            "/plugins",
            Arc::new(HeaderPermissionAuthorizer::new()),
            1024,
        );
        let mut route = declaration("GET", "/secret", "secret");
        route.permissions = vec!["reports:read".to_string()];
        table.mount("reports", vec![(route, echo())]).await.unwrap();

        let denied = table.dispatch(get("/api/plugins/reports/secret")).await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = HttpRequest::builder()
            .uri("/api/plugins/reports/secret")
            .header("x-permissions", "reports:read")
            .body(Body::empty())
            .unwrap();
        assert_eq!(table.dispatch(allowed).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_remount_after_unmount() {
        let table = table();
        table
            .mount("reports", vec![(declaration("GET", "/a", "a"), echo())])
            .await
            .unwrap();
        assert!(table
            .mount("reports", vec![(declaration("GET", "/a", "a"), echo())])
            .await
            .is_err());

        assert!(table.unmount("reports").await);
        assert!(!table.unmount("reports").await);
        table
            .mount("reports", vec![(declaration("GET", "/a", "a"), echo())])
            .await
            .unwrap();
        assert_eq!(
            table.dispatch(get("/plugins/reports/a")).await.status(),
            StatusCode::OK
        );
    }
}
