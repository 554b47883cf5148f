//! HTTP gateway bridge.
//!
//! Business modules bind HTTP routes to RPC methods through
//! [`GatewayHandlerFunc`]s, which receive the [`GatewayMux`] and a channel to
//! the server's own RPC listener. Each translated request carries the
//! transport metadata built in [`metadata`]; replies go back through the
//! outgoing header matcher.
//!
//! - [`headers`]: incoming and outgoing header allow-lists
//! - [`metadata`]: inbound metadata and the cookie bridge
//! - [`mux`]: route table and response forwarding
//! - [`logging`], [`cors`]: HTTP middlewares
//! - [`route`]: static sub-routes

pub mod cors;
pub mod headers;
pub mod logging;
pub mod metadata;
pub mod mux;
pub mod route;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use http::Method;
use rpcgate_core::BoxError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

pub use headers::{default_incoming, default_outgoing, deny_all, HeaderMatcher};
pub use metadata::{CookieAuthorization, MetadataModifier};
pub use mux::{GatewayMux, GatewayReply, GatewayRequest};
pub use route::Route;

/// Header matchers and metadata modifiers of the bridge.
#[derive(Clone)]
pub struct GatewayConfig {
    pub incoming: HeaderMatcher,
    pub outgoing: HeaderMatcher,
    pub modifiers: Vec<Arc<dyn MetadataModifier>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            incoming: headers::incoming_matcher(),
            outgoing: headers::outgoing_matcher(),
            modifiers: vec![Arc::new(CookieAuthorization)],
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("modifiers", &self.modifiers.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("route pattern must start with '/' and use {{name}} segments: {0}")]
    InvalidPattern(String),
    #[error("unsupported http method {0}")]
    UnsupportedMethod(Method),
    #[error("route {method} {pattern} is already bound")]
    DuplicateRoute { method: Method, pattern: String },
    #[error("route pattern {0} conflicts with another pattern")]
    ConflictingRoute(String),
    #[error("static route pattern must start with '/' and not be the root: {0:?}")]
    InvalidRoute(String),
    #[error("invalid cors origin pattern: {0}")]
    Cors(#[from] regex::Error),
    #[error("failed to set up rpc channel: {0}")]
    Dial(#[from] tonic::transport::Error),
    #[error("gateway handler registration failed: {0}")]
    Handler(#[source] BoxError),
}

/// Passed to every [`GatewayHandlerFunc`].
#[derive(Debug, Clone)]
pub struct GatewayContext {
    /// Cancelled when the server shuts down.
    pub cancel: CancellationToken,
    /// Largest message RPC clients created by handlers should decode.
    pub max_recv_msg_size: usize,
}

/// Registration hook binding a module's HTTP routes.
pub type GatewayHandlerFunc =
    Box<dyn FnOnce(&GatewayContext, &mut GatewayMux, Channel) -> Result<(), BoxError> + Send>;

/// Lazily connected channel to the RPC listener at `addr`. An unspecified
/// bind address is dialed on loopback.
///
/// # Errors
///
/// Returns `Dial` when the address does not form a valid endpoint.
pub fn dial(addr: SocketAddr) -> Result<Channel, GatewayError> {
    let target = if addr.ip().is_unspecified() {
        SocketAddr::new(loopback_for(addr), addr.port())
    } else {
        addr
    };
    let endpoint = Endpoint::from_shared(format!("http://{target}"))?;
    Ok(endpoint.connect_lazy())
}

fn loopback_for(addr: SocketAddr) -> std::net::IpAddr {
    if addr.is_ipv4() {
        std::net::Ipv4Addr::LOCALHOST.into()
    } else {
        std::net::Ipv6Addr::LOCALHOST.into()
    }
}

/// Runs `handlers` against a fresh mux and returns its router.
///
/// # Errors
///
/// Returns the first handler failure, or a route table error.
pub fn build_router(
    config: &GatewayConfig,
    context: &GatewayContext,
    channel: &Channel,
    handlers: Vec<GatewayHandlerFunc>,
    max_body: usize,
) -> Result<Router, GatewayError> {
    let mut mux = GatewayMux::new(config, max_body);
    let count = handlers.len();
    for handler in handlers {
        handler(context, &mut mux, channel.clone()).map_err(GatewayError::Handler)?;
    }
    debug!(handlers = count, "gateway handlers registered");
    mux.into_router()
}

/// Mounts `routes` ahead of `gateway`, which serves everything else.
///
/// # Errors
///
/// Returns `InvalidRoute` for a malformed pattern.
pub fn mount_routes(routes: Vec<Route>, gateway: Router) -> Result<Router, GatewayError> {
    let mut router = Router::new();
    for route in routes {
        router = route.mount(router)?;
    }
    Ok(router.fallback_service(gateway))
}
