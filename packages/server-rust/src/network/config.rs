//! Server configuration and its validation.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::gateway::GatewayConfig;
use crate::service::middleware::ServerMiddleware;
use crate::telemetry::MetricsRegistry;

/// Default largest decoded RPC message: 64 MiB.
pub const DEFAULT_MAX_RECV_MSG_SIZE: usize = 64 * 1024 * 1024;

/// Listener and transport settings.
///
/// | field               | default     |
/// |---------------------|-------------|
/// | `host`              | `0.0.0.0`   |
/// | `rpc_port`          | 0 (OS)      |
/// | `http_port`         | 0 (OS)      |
/// | `reflection`        | off         |
/// | `cors_origin`       | `*`         |
/// | `max_recv_msg_size` | 64 MiB      |
/// | `shutdown_grace`    | 30 s        |
/// | `max_http_body`     | 64 MiB      |
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners.
    pub host: String,
    /// RPC listener port. 0 means OS-assigned.
    pub rpc_port: u16,
    /// HTTP gateway port. 0 means OS-assigned.
    pub http_port: u16,
    /// Serve the reflection service for registered descriptor sets.
    pub reflection: bool,
    /// `*` or a regular expression matched against `Origin`.
    pub cors_origin: String,
    /// Largest RPC message decoded, also handed to gateway clients.
    pub max_recv_msg_size: usize,
    /// Bound on the HTTP drain, and on the final in-flight wait.
    pub shutdown_grace: Duration,
    /// Largest gateway request body that is read.
    pub max_http_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            rpc_port: 0,
            http_port: 0,
            reflection: false,
            cors_origin: "*".to_string(),
            max_recv_msg_size: DEFAULT_MAX_RECV_MSG_SIZE,
            shutdown_grace: Duration::from_secs(30),
            max_http_body: DEFAULT_MAX_RECV_MSG_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("rpc and http listeners cannot share port {0}")]
    SharedPort(u16),
    #[error("invalid cors origin pattern {pattern:?}: {source}")]
    CorsOrigin {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl ServerConfig {
    /// Checks the configuration before any listener is bound.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.rpc_port != 0 && self.rpc_port == self.http_port {
            return Err(ConfigError::SharedPort(self.rpc_port));
        }
        if self.cors_origin != "*" {
            Regex::new(&self.cors_origin).map_err(|source| ConfigError::CorsOrigin {
                pattern: self.cors_origin.clone(),
                source,
            })?;
        }
        if self.max_recv_msg_size == 0 {
            return Err(ConfigError::Zero("max_recv_msg_size"));
        }
        if self.max_http_body == 0 {
            return Err(ConfigError::Zero("max_http_body"));
        }
        if self.shutdown_grace.is_zero() {
            return Err(ConfigError::Zero("shutdown_grace"));
        }
        Ok(())
    }
}

/// Everything a [`ServerService`](super::ServerService) is built from.
#[derive(Clone, Default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    /// Caller-supplied units, run between the fixed units in this order.
    pub interceptors: Vec<Arc<dyn ServerMiddleware>>,
    pub metrics: MetricsRegistry,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("server", &self.server)
            .field("gateway", &self.gateway)
            .field(
                "interceptors",
                &self.interceptors.iter().map(|u| u.name()).collect::<Vec<_>>(),
            )
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.rpc_port, 0);
        assert_eq!(config.http_port, 0);
        assert!(!config.reflection);
        assert_eq!(config.cors_origin, "*");
        assert_eq!(config.max_recv_msg_size, 64 * 1024 * 1024);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.max_http_body, config.max_recv_msg_size);
        config.validate().unwrap();
    }

    #[test]
    fn empty_host_is_rejected() {
        let config = ServerConfig {
            host: "  ".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyHost)));
    }

    #[test]
    fn shared_port_is_rejected_unless_os_assigned() {
        let config = ServerConfig {
            rpc_port: 8080,
            http_port: 8080,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::SharedPort(8080))));

        let config = ServerConfig {
            rpc_port: 9090,
            http_port: 8080,
            ..ServerConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn cors_pattern_must_compile() {
        let config = ServerConfig {
            cors_origin: "([a-z".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CorsOrigin { .. })
        ));

        let config = ServerConfig {
            cors_origin: r"^https://.*\.example\.com$".into(),
            ..ServerConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn zero_sizes_and_grace_are_rejected() {
        let config = ServerConfig {
            max_recv_msg_size: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("max_recv_msg_size"))));

        let config = ServerConfig {
            shutdown_grace: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("shutdown_grace"))));
    }

    #[test]
    fn service_config_debug_lists_units() {
        let config = ServiceConfig {
            interceptors: vec![Arc::new(crate::service::middleware::RequestIdResolver::default())],
            ..ServiceConfig::default()
        };
        assert!(format!("{config:?}").contains("request_id"));
    }
}
