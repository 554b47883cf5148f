//! rpcgate server: the interceptor pipeline, the HTTP gateway bridge and the
//! server lifecycle.

pub mod gateway;
pub mod network;
pub mod service;
pub mod telemetry;

pub use network::{ServerConfig, ServerService, ServiceConfig};
pub use service::{CallMessage, Pipeline, ServerMiddleware};
pub use telemetry::MetricsRegistry;
