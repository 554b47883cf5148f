//! Request/response logging for gateway traffic.

use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use futures_util::{stream, StreamExt};
use http::StatusCode;
use tracing::{info, warn};

use super::headers::{deny_all, HeaderMatcher};
use super::mux::body_read_error;

/// Logs status and duration of every HTTP call. Non-200 responses also log
/// the response body and a copy of the request body.
///
/// The request body is buffered (up to `limit` bytes) and the handler gets
/// the same bytes. A body that cannot be read, or that exceeds `limit`, is
/// answered with an error response and never reaches the handler. Response
/// bodies are forwarded unchanged; only the logged copy is cut at `limit`.
pub async fn log_http(State(limit): State<usize>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let (parts, body) = request.into_parts();
    let request_body = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let outgoing: HeaderMatcher = Arc::new(deny_all);
            let response = body_read_error(&err, &outgoing);
            warn!(
                http.status = response.status().as_u16(),
                http.method = %method,
                http.path = %path,
                error = %err,
                "http request body rejected"
            );
            return response;
        }
    };
    let request = Request::from_parts(parts, Body::from(request_body.clone()));

    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let status = response.status();

    info!(
        http.status = status.as_u16(),
        http.method = %method,
        http.path = %path,
        elapsed_ms,
        "http call"
    );
    if status == StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let (response_body, failure) = collect(body).await;
    warn!(
        http.status = status.as_u16(),
        http.path = %path,
        response_body = %String::from_utf8_lossy(bounded(&response_body, limit)),
        request_body = %String::from_utf8_lossy(&request_body),
        "http call failed"
    );
    let body = match failure {
        None => Body::from(response_body),
        Some(err) => Body::from_stream(stream::iter([Ok(response_body), Err(err)])),
    };
    Response::from_parts(parts, body)
}

/// Reads the whole body, keeping what arrived before a read error.
async fn collect(body: Body) -> (Bytes, Option<axum::Error>) {
    let mut data = body.into_data_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(chunk) => buffer.extend_from_slice(&chunk),
            Err(err) => return (Bytes::from(buffer), Some(err)),
        }
    }
    (Bytes::from(buffer), None)
}

fn bounded(bytes: &[u8], limit: usize) -> &[u8] {
    &bytes[..bytes.len().min(limit)]
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::middleware::from_fn_with_state;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        Router::new()
            .route("/echo", post(|body: String| async move { body }))
            .route(
                "/fail",
                post(|body: String| async move { (StatusCode::CONFLICT, format!("rejected {body}")) }),
            )
            .route(
                "/large-failure",
                post(|| async { (StatusCode::BAD_GATEWAY, "y".repeat(4096)) }),
            )
            .layer(from_fn_with_state(1024_usize, log_http))
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn handler_still_receives_the_body() {
        let response = router()
            .oneshot(http::Request::post("/echo").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello");
    }

    #[tokio::test]
    async fn failed_response_body_is_preserved() {
        let response = router()
            .oneshot(http::Request::post("/fail").body(Body::from("req")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_text(response).await, "rejected req");
    }

    #[tokio::test]
    async fn failed_response_larger_than_limit_is_forwarded_whole() {
        let response = router()
            .oneshot(http::Request::post("/large-failure").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(response).await.len(), 4096);
    }

    #[tokio::test]
    async fn oversized_body_never_reaches_the_handler() {
        let reached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached);
        let router = Router::new()
            .route(
                "/echo",
                post(move |body: Bytes| {
                    flag.store(true, Ordering::SeqCst);
                    async move { body.len().to_string() }
                }),
            )
            .layer(from_fn_with_state(1024_usize, log_http));

        let response = router
            .oneshot(
                http::Request::post("/echo")
                    .body(Body::from(vec![b'x'; 2048]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[test]
    fn logged_copy_is_bounded() {
        assert_eq!(bounded(b"abcdef", 4), b"abcd");
        assert_eq!(bounded(b"ab", 4), b"ab");
    }
}
