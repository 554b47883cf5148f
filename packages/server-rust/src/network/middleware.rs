//! HTTP middleware stack for gateway traffic.
//!
//! Layer ordering follows the outer-to-inner convention: the first layer
//! listed processes the request first on the way in, and the response
//! last on the way out.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::Router;
use tonic::Status;

use super::config::ServerConfig;
use super::shutdown::ShutdownController;
use crate::gateway::cors::{cors_layer, short_circuit_options};
use crate::gateway::logging::log_http;
use crate::gateway::mux::error_response;
use crate::gateway::{GatewayError, HeaderMatcher};

/// Wraps the gateway router in its middlewares.
///
/// **Ordering (outermost to innermost):**
/// 1. `log_http` -- status, duration, and bodies of failed calls
/// 2. `CORS` -- origin reflection and preflight answers
/// 3. `short_circuit_options` -- every other `OPTIONS` ends here
/// 4. `track_in_flight` -- refuses calls while draining, counts the rest
///
/// # Errors
///
/// Returns `Cors` when the origin pattern does not compile.
pub fn with_http_layers(
    router: Router,
    config: &ServerConfig,
    shutdown: Arc<ShutdownController>,
    outgoing: HeaderMatcher,
) -> Result<Router, GatewayError> {
    let cors = cors_layer(&config.cors_origin)?;
    Ok(router
        .layer(from_fn_with_state(
            InFlight { shutdown, outgoing },
            track_in_flight,
        ))
        .layer(from_fn(short_circuit_options))
        .layer(cors)
        .layer(from_fn_with_state(config.max_http_body, log_http)))
}

#[derive(Clone)]
struct InFlight {
    shutdown: Arc<ShutdownController>,
    outgoing: HeaderMatcher,
}

async fn track_in_flight(State(state): State<InFlight>, request: Request, next: Next) -> Response {
    if !state.shutdown.health_state().is_serving() {
        return error_response(&Status::unavailable("server is not serving"), &state.outgoing);
    }
    let _guard = state.shutdown.in_flight_guard();
    next.run(request).await
}
