//! Cross-origin handling for gateway traffic.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::{self, HeaderName};
use http::{Method, StatusCode};
use regex::Regex;
use tower_http::cors::{AllowOrigin, CorsLayer};

const ALLOWED_METHODS: [Method; 4] = [Method::GET, Method::POST, Method::PATCH, Method::DELETE];

/// Reflects `Origin` back when it matches `origin`: `*` matches any origin,
/// anything else is an unanchored regular expression.
///
/// # Errors
///
/// Returns the regex error for an invalid pattern.
pub fn cors_layer(origin: &str) -> Result<CorsLayer, regex::Error> {
    let allow_origin = if origin == "*" {
        AllowOrigin::mirror_request()
    } else {
        let pattern = Regex::new(origin)?;
        AllowOrigin::predicate(move |origin, _parts| {
            origin.to_str().is_ok_and(|o| pattern.is_match(o))
        })
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(ALLOWED_METHODS)
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            header::AUTHORIZATION,
            HeaderName::from_static("responsetype"),
        ]))
}

/// Answers every `OPTIONS` request with an empty 200.
pub async fn short_circuit_options(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::middleware::from_fn;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn router(origin: &str) -> Router {
        Router::new()
            .route("/v1/items", get(|| async { "items" }))
            .layer(from_fn(short_circuit_options))
            .layer(cors_layer(origin).unwrap())
    }

    async fn get_from(origin: &str, request_origin: &str) -> Response {
        router(origin)
            .oneshot(
                http::Request::get("/v1/items")
                    .header(header::ORIGIN, request_origin)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn wildcard_reflects_any_origin() {
        let response = get_from("*", "https://app.example.com").await;
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "https://app.example.com"
        );
    }

    #[tokio::test]
    async fn pattern_reflects_only_matching_origins() {
        let response = get_from(r"^https://.*\.example\.com$", "https://app.example.com").await;
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        let response = get_from(r"^https://.*\.example\.com$", "https://evil.test").await;
        assert!(!response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_advertises_methods() {
        let response = router("*")
            .oneshot(
                http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/v1/items")
                    .header(header::ORIGIN, "https://app.example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PATCH")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let methods = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(methods.contains("PATCH"), "{methods}");
    }

    #[tokio::test]
    async fn plain_options_never_reaches_the_router() {
        let response = router("*")
            .oneshot(
                http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/v1/unrouted")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(cors_layer("(unclosed").is_err());
    }
}
