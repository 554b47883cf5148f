//! HTTP route to RPC method translation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{Json, Router};
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::LengthLimitError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tonic::metadata::MetadataMap;
use tonic::{Extensions, Status};
use tracing::debug;

use super::headers::HeaderMatcher;
use super::metadata::{inbound_metadata, MetadataModifier, RouteInfo};
use super::{GatewayConfig, GatewayError};
use crate::service::status::http_status;

/// One HTTP request, translated for an RPC call.
#[derive(Debug)]
pub struct GatewayRequest {
    pub metadata: HeaderMap,
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Bytes,
}

impl GatewayRequest {
    /// Decodes the body as JSON. An empty body decodes as `{}`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Status> {
        let body: &[u8] = if self.body.is_empty() { b"{}" } else { &self.body };
        serde_json::from_slice(body)
            .map_err(|err| Status::invalid_argument(format!("invalid request body: {err}")))
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` when the pattern bound no such parameter.
    pub fn param(&self, name: &str) -> Result<&str, Status> {
        self.path_params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Status::invalid_argument(format!("missing path parameter {name}")))
    }

    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Wraps `message` in a tonic request carrying the translated metadata.
    #[must_use]
    pub fn into_request<T>(self, message: T) -> tonic::Request<T> {
        tonic::Request::from_parts(
            MetadataMap::from_headers(self.metadata),
            Extensions::default(),
            message,
        )
    }
}

/// The translated reply: response metadata and the JSON body.
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub metadata: HeaderMap,
    pub body: Value,
}

impl GatewayReply {
    #[must_use]
    pub fn new(body: Value) -> Self {
        Self {
            metadata: HeaderMap::new(),
            body,
        }
    }

    /// Keeps the response metadata and renders the message with `render`.
    pub fn from_response<T>(response: tonic::Response<T>, render: impl FnOnce(T) -> Value) -> Self {
        let (metadata, message, _extensions) = response.into_parts();
        Self {
            metadata: metadata.into_headers(),
            body: render(message),
        }
    }

    /// Keeps the response metadata and serializes the message.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the message cannot be serialized.
    pub fn json<T: Serialize>(response: tonic::Response<T>) -> Result<Self, Status> {
        let (metadata, message, _extensions) = response.into_parts();
        let body = serde_json::to_value(message)
            .map_err(|err| Status::internal(format!("failed to encode response: {err}")))?;
        Ok(Self {
            metadata: metadata.into_headers(),
            body,
        })
    }
}

/// Copies allowed response metadata onto the HTTP response. A `location`
/// entry turns the response into a 302 redirect.
#[must_use]
pub fn forward_response(reply: GatewayReply, outgoing: &HeaderMatcher) -> Response {
    let mut response = Json(reply.body).into_response();
    forward_metadata(&reply.metadata, outgoing, response.headers_mut());
    if let Some(location) = reply.metadata.get(header::LOCATION) {
        response
            .headers_mut()
            .insert(header::LOCATION, location.clone());
        *response.status_mut() = StatusCode::FOUND;
    }
    response
}

fn forward_metadata(metadata: &HeaderMap, outgoing: &HeaderMatcher, headers: &mut HeaderMap) {
    for (name, value) in metadata {
        if let Some(name) = outgoing(name.as_str())
            .and_then(|mapped| HeaderName::from_bytes(mapped.as_bytes()).ok())
        {
            headers.append(name, value.clone());
        }
    }
}

/// Renders an RPC status as a JSON error with the matching HTTP status.
#[must_use]
pub fn error_response(status: &Status, outgoing: &HeaderMatcher) -> Response {
    let body = json!({
        "code": status.code() as i32,
        "message": status.message(),
        "details": [],
    });
    let mut response = (http_status(status.code()), Json(body)).into_response();
    forward_metadata(
        &status.metadata().clone().into_headers(),
        outgoing,
        response.headers_mut(),
    );
    if status.code() == tonic::Code::Unauthenticated {
        if let Ok(value) = HeaderValue::from_str(status.message()) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

/// Error response for a request body that could not be read: 413 when it
/// exceeded the limit, 400 otherwise.
#[must_use]
pub fn body_read_error(err: &axum::Error, outgoing: &HeaderMatcher) -> Response {
    if exceeds_limit(err) {
        let mut response = error_response(
            &Status::resource_exhausted("request body exceeds the size limit"),
            outgoing,
        );
        *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
        return response;
    }
    error_response(&Status::invalid_argument("failed to read request body"), outgoing)
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}

type BoxReply = std::pin::Pin<Box<dyn Future<Output = Result<GatewayReply, Status>> + Send>>;
type Binding = Arc<dyn Fn(GatewayRequest) -> BoxReply + Send + Sync>;

struct Shared {
    incoming: HeaderMatcher,
    outgoing: HeaderMatcher,
    modifiers: Vec<Arc<dyn MetadataModifier>>,
    max_body: usize,
}

/// Route table binding `(method, pattern)` pairs to translation closures.
///
/// Patterns use `{name}` segments, e.g. `/v1/projects/{project_id}`.
pub struct GatewayMux {
    routes: BTreeMap<String, MethodRouter>,
    bound: HashSet<(Method, String)>,
    shared: Arc<Shared>,
}

impl GatewayMux {
    #[must_use]
    pub fn new(config: &GatewayConfig, max_body: usize) -> Self {
        Self {
            routes: BTreeMap::new(),
            bound: HashSet::new(),
            shared: Arc::new(Shared {
                incoming: Arc::clone(&config.incoming),
                outgoing: Arc::clone(&config.outgoing),
                modifiers: config.modifiers.clone(),
                max_body,
            }),
        }
    }

    /// Binds `method pattern` to `rpc_method`, translated by `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed pattern, an unsupported method, or a
    /// pair that is already bound.
    pub fn handle<F, Fut>(
        &mut self,
        method: Method,
        pattern: &str,
        rpc_method: &str,
        handler: F,
    ) -> Result<&mut Self, GatewayError>
    where
        F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayReply, Status>> + Send + 'static,
    {
        validate_pattern(pattern)?;
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|_| GatewayError::UnsupportedMethod(method.clone()))?;
        if !self.bound.insert((method.clone(), pattern.to_owned())) {
            return Err(GatewayError::DuplicateRoute {
                method,
                pattern: pattern.to_owned(),
            });
        }

        let binding: Binding =
            Arc::new(move |request: GatewayRequest| -> BoxReply { Box::pin(handler(request)) });
        let shared = Arc::clone(&self.shared);
        let pattern_owned: Arc<str> = Arc::from(pattern);
        let rpc_method: Arc<str> = Arc::from(rpc_method);
        let endpoint = move |request: Request| {
            let shared = Arc::clone(&shared);
            let binding = Arc::clone(&binding);
            let pattern = Arc::clone(&pattern_owned);
            let rpc_method = Arc::clone(&rpc_method);
            async move { translate(&shared, &binding, &pattern, &rpc_method, request).await }
        };

        let router = match self.routes.remove(pattern) {
            Some(existing) => existing.on(filter, endpoint),
            None => on(filter, endpoint).fallback(method_not_allowed),
        };
        self.routes.insert(pattern.to_owned(), router);
        Ok(self)
    }

    /// The axum router serving every binding; unmatched paths get a JSON 404.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingRoute` when two patterns overlap.
    pub fn into_router(self) -> Result<Router, GatewayError> {
        let outgoing = Arc::clone(&self.shared.outgoing);
        let mut router = Router::new();
        for (pattern, method_router) in self.routes {
            // axum reports route conflicts by panicking
            let path = pattern.clone();
            router = catch_unwind(AssertUnwindSafe(move || router.route(&path, method_router)))
                .map_err(|_| GatewayError::ConflictingRoute(pattern))?;
        }
        Ok(router.fallback(move || {
            let outgoing = Arc::clone(&outgoing);
            async move { error_response(&Status::not_found("Not Found"), &outgoing) }
        }))
    }
}

async fn method_not_allowed() -> Response {
    let body = json!({
        "code": tonic::Code::Unimplemented as i32,
        "message": "Method Not Allowed",
        "details": [],
    });
    (StatusCode::NOT_IMPLEMENTED, Json(body)).into_response()
}

pub(crate) fn validate_pattern(pattern: &str) -> Result<(), GatewayError> {
    if !pattern.starts_with('/') {
        return Err(GatewayError::InvalidPattern(pattern.to_owned()));
    }
    let legacy = pattern
        .split('/')
        .any(|segment| segment.starts_with(':') || segment.starts_with('*'));
    if legacy {
        return Err(GatewayError::InvalidPattern(pattern.to_owned()));
    }
    Ok(())
}

async fn translate(
    shared: &Shared,
    binding: &Binding,
    pattern: &str,
    rpc_method: &str,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let path_params = match Path::<HashMap<String, String>>::from_request_parts(&mut parts, &()).await {
        Ok(Path(params)) => params,
        Err(rejection) => {
            return error_response(
                &Status::invalid_argument(rejection.body_text()),
                &shared.outgoing,
            )
        }
    };
    let query = match Query::<HashMap<String, String>>::try_from_uri(&parts.uri) {
        Ok(Query(query)) => query,
        Err(rejection) => {
            return error_response(
                &Status::invalid_argument(rejection.body_text()),
                &shared.outgoing,
            )
        }
    };
    let body = match axum::body::to_bytes(body, shared.max_body).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, "failed to read gateway request body");
            return body_read_error(&err, &shared.outgoing);
        }
    };

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let metadata = inbound_metadata(
        &parts,
        Some(RouteInfo {
            pattern,
            rpc_method,
        }),
        peer,
        &shared.incoming,
        &shared.modifiers,
    );

    let request = GatewayRequest {
        metadata,
        path_params,
        query,
        body,
    };
    match binding(request).await {
        Ok(reply) => forward_response(reply, &shared.outgoing),
        Err(status) => error_response(&status, &shared.outgoing),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use serde::Deserialize;
    use tower::ServiceExt;

    use super::*;
    use crate::gateway::headers::outgoing_matcher;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn mux() -> GatewayMux {
        GatewayMux::new(&GatewayConfig::default(), 1024)
    }

    #[derive(Debug, Deserialize)]
    struct Rename {
        name: String,
    }

    fn items_router() -> Router {
        let mut mux = mux();
        mux.handle(
            Method::GET,
            "/v1/projects/{project_id}/items/{item}",
            "/demo.Items/Get",
            |request| async move {
                let mut reply = GatewayReply::new(json!({
                    "project": request.param("project_id")?,
                    "item": request.param("item")?,
                    "verbose": request.query("verbose"),
                    "method": request.metadata.get("grpc-method").and_then(|v| v.to_str().ok()),
                }));
                reply
                    .metadata
                    .insert("x-request-id", HeaderValue::from_static("abc"));
                reply
                    .metadata
                    .insert("x-internal-debug", HeaderValue::from_static("secret"));
                Ok::<_, Status>(reply)
            },
        )
        .unwrap()
        .handle(
            Method::PATCH,
            "/v1/projects/{project_id}/items/{item}",
            "/demo.Items/Rename",
            |request| async move {
                let rename: Rename = request.json()?;
                Ok::<_, Status>(GatewayReply::new(json!({ "name": rename.name })))
            },
        )
        .unwrap()
        .handle(Method::POST, "/v1/login", "/demo.Auth/Login", |_request| async {
            let mut reply = GatewayReply::new(json!({}));
            reply
                .metadata
                .insert("location", HeaderValue::from_static("/v1/home"));
            Ok::<_, Status>(reply)
        })
        .unwrap()
        .handle(Method::DELETE, "/v1/locked", "/demo.Locked/Delete", |_request| async {
            Err::<GatewayReply, _>(Status::permission_denied("permission denied"))
        })
        .unwrap();
        mux.into_router().unwrap()
    }

    #[tokio::test]
    async fn binding_receives_params_query_and_metadata() {
        let response = items_router()
            .oneshot(
                http::Request::get("/v1/projects/p1/items/i9?verbose=yes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        let body = body_json(response).await;
        assert_eq!(body["project"], "p1");
        assert_eq!(body["item"], "i9");
        assert_eq!(body["verbose"], "yes");
        assert_eq!(body["method"], "/demo.Items/Get");

        assert_eq!(headers.get("x-request-id").unwrap(), "abc");
        assert!(headers.get("x-internal-debug").is_none());
    }

    #[tokio::test]
    async fn json_body_is_decoded() {
        let response = items_router()
            .oneshot(
                http::Request::patch("/v1/projects/p1/items/i9")
                    .body(Body::from(r#"{"name":"renamed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["name"], "renamed");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let response = items_router()
            .oneshot(
                http::Request::patch("/v1/projects/p1/items/i9")
                    .body(Body::from("{nope"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 3);
    }

    #[tokio::test]
    async fn location_metadata_redirects() {
        let response = items_router()
            .oneshot(http::Request::post("/v1/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/v1/home");
    }

    #[tokio::test]
    async fn rpc_error_is_rendered_as_json() {
        let response = items_router()
            .oneshot(http::Request::delete("/v1/locked").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["code"], 7);
        assert_eq!(body["message"], "permission denied");
        assert_eq!(body["details"], json!([]));
    }

    #[tokio::test]
    async fn unmatched_path_is_json_not_found() {
        let response = items_router()
            .oneshot(http::Request::get("/v2/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], 5);
    }

    #[tokio::test]
    async fn unbound_method_is_not_implemented() {
        let response = items_router()
            .oneshot(http::Request::put("/v1/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let response = items_router()
            .oneshot(
                http::Request::patch("/v1/projects/p1/items/i9")
                    .body(Body::from(vec![b'x'; 4096]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["code"], tonic::Code::ResourceExhausted as i32);
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut mux = mux();
        let ok = |_request: GatewayRequest| async { Ok::<_, Status>(GatewayReply::new(Value::Null)) };
        mux.handle(Method::GET, "/v1/a", "/a.A/Get", ok).unwrap();
        let err = mux.handle(Method::GET, "/v1/a", "/a.A/Get", ok).err().unwrap();
        assert!(matches!(err, GatewayError::DuplicateRoute { .. }));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        let mut mux = mux();
        let ok = |_request: GatewayRequest| async { Ok::<_, Status>(GatewayReply::new(Value::Null)) };
        for pattern in ["v1/a", "/v1/:id", "/v1/*rest"] {
            let err = mux.handle(Method::GET, pattern, "/a.A/Get", ok).err().unwrap();
            assert!(matches!(err, GatewayError::InvalidPattern(_)), "{pattern}");
        }
    }

    #[test]
    fn conflicting_patterns_are_an_error() {
        let mut mux = mux();
        let ok = |_request: GatewayRequest| async { Ok::<_, Status>(GatewayReply::new(Value::Null)) };
        mux.handle(Method::GET, "/v1/{id}", "/a.A/Get", ok).unwrap();
        mux.handle(Method::GET, "/v1/{name}", "/a.A/Find", ok).unwrap();
        assert!(matches!(
            mux.into_router().err().unwrap(),
            GatewayError::ConflictingRoute(_)
        ));
    }

    #[test]
    fn unauthenticated_error_sets_www_authenticate() {
        let response = error_response(&Status::unauthenticated("invalid credential"), &outgoing_matcher());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("www-authenticate").unwrap(),
            "invalid credential"
        );
    }
}
