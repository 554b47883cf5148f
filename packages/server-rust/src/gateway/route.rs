//! Static sub-routes mounted next to the translated RPC traffic.

use std::convert::Infallible;
use std::path::Path;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};
use tower_http::services::ServeDir;

use super::GatewayError;
use crate::telemetry::MetricsRegistry;

type RouteService = BoxCloneSyncService<Request, Response, Infallible>;

/// An opaque HTTP handler served at `pattern`, outside the RPC path and the
/// gateway middlewares. A pattern ending in `/` serves the whole prefix.
#[derive(Clone)]
pub struct Route {
    pattern: String,
    service: RouteService,
}

impl Route {
    pub fn new<S>(pattern: impl Into<String>, service: S) -> Self
    where
        S: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        Self {
            pattern: pattern.into(),
            service: BoxCloneSyncService::new(service.map_response(IntoResponse::into_response)),
        }
    }

    /// Files under `dir`, served below `prefix`.
    pub fn static_dir(prefix: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        Self::new(prefix, ServeDir::new(dir))
    }

    /// `GET /metrics` in Prometheus text format.
    #[must_use]
    pub fn metrics(registry: MetricsRegistry) -> Self {
        Self::new(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move { registry.render() }
            }),
        )
    }

    /// A fixed JSON document, e.g. an `OpenAPI` description.
    pub fn json_document(pattern: impl Into<String>, document: Value) -> Self {
        Self::new(
            pattern,
            get(move || {
                let document = document.clone();
                async move { Json(document) }
            }),
        )
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn mount(self, router: Router) -> Result<Router, GatewayError> {
        let pattern = self.pattern;
        if !pattern.starts_with('/') || pattern == "/" {
            return Err(GatewayError::InvalidRoute(pattern));
        }
        Ok(match pattern.strip_suffix('/') {
            Some(prefix) => router.nest_service(prefix, self.service),
            None => router.route_service(&pattern, self.service),
        })
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use http::StatusCode;
    use serde_json::json;

    use super::*;

    async fn fetch(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn exact_route_serves_document() {
        let router = Route::json_document("/openapi.json", json!({ "openapi": "3.0.0" }))
            .mount(Router::new())
            .unwrap();
        let (status, body) = fetch(router, "/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("3.0.0"));
    }

    #[tokio::test]
    async fn prefix_route_serves_directory() {
        let dir = std::env::temp_dir().join(format!("rpcgate-route-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.txt"), "docs").unwrap();

        let router = Route::static_dir("/docs/", &dir).mount(Router::new()).unwrap();
        let (status, body) = fetch(router, "/docs/index.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "docs");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn metrics_route_renders_registry() {
        let registry = MetricsRegistry::prometheus();
        registry.record(|| metrics::counter!("route_test_total").increment(1));
        let router = Route::metrics(registry).mount(Router::new()).unwrap();
        let (status, body) = fetch(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("route_test_total"));
    }

    #[test]
    fn root_and_relative_patterns_are_rejected() {
        for pattern in ["/", "", "docs/"] {
            let route = Route::json_document(pattern, Value::Null);
            assert!(
                matches!(route.mount(Router::new()), Err(GatewayError::InvalidRoute(_))),
                "{pattern}"
            );
        }
    }
}
