//! Server configuration, lifecycle, shutdown control and the HTTP layers.

pub mod config;
pub mod middleware;
pub mod module;
pub mod shutdown;
pub mod signal;

pub use config::{ConfigError, ServerConfig, ServiceConfig, DEFAULT_MAX_RECV_MSG_SIZE};
pub use module::{ServerAddrs, ServerError, ServerService};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use signal::shutdown_signal;
