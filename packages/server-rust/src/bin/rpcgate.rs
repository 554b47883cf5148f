//! rpcgate server binary: the health service and `/metrics` behind the
//! interceptor pipeline, on an RPC and an HTTP gateway listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use rpcgate_server::gateway::Route;
use rpcgate_server::network::{shutdown_signal, ServerConfig, ServerService, ServiceConfig};
use rpcgate_server::service::middleware::authn::JwtClaimParser;
use rpcgate_server::service::middleware::{AuthnMiddleware, RequestIdResolver};
use rpcgate_server::service::ServerMiddleware;
use rpcgate_server::telemetry::{init_tracing, LogFormat, MetricsRegistry};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rpcgate", version, about)]
struct Args {
    /// Bind address for both listeners.
    #[arg(long, env = "RPCGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "RPCGATE_GRPC_PORT", default_value_t = 9090)]
    grpc_port: u16,

    #[arg(long, env = "RPCGATE_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Serve the gRPC reflection service.
    #[arg(long, env = "RPCGATE_WITH_GRPC_REFLECTION")]
    with_grpc_reflection: bool,

    /// `*` or a regular expression matched against the `Origin` header.
    #[arg(long, env = "RPCGATE_CORS", default_value = "*")]
    cors: String,

    #[arg(long, env = "RPCGATE_MAX_RECV_MSG_SIZE", default_value_t = rpcgate_server::network::DEFAULT_MAX_RECV_MSG_SIZE)]
    max_recv_msg_size: usize,

    #[arg(long, env = "RPCGATE_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// HS256 secret; enables bearer authentication with anonymous fallback.
    #[arg(long, env = "RPCGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    #[arg(long, env = "RPCGATE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            rpc_port: self.grpc_port,
            http_port: self.http_port,
            reflection: self.with_grpc_reflection,
            cors_origin: self.cors.clone(),
            max_recv_msg_size: self.max_recv_msg_size,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            max_http_body: self.max_recv_msg_size,
        }
    }

    fn interceptors(&self) -> Vec<Arc<dyn ServerMiddleware>> {
        let mut units: Vec<Arc<dyn ServerMiddleware>> =
            vec![Arc::new(RequestIdResolver::default())];
        if let Some(secret) = &self.jwt_secret {
            let parser = JwtClaimParser::hs256(secret.as_bytes(), None, None);
            units.push(Arc::new(
                AuthnMiddleware::new(Arc::new(parser)).allow_anonymous(true),
            ));
        }
        units
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, "info")
        .map_err(|err| anyhow::anyhow!(err))
        .context("failed to initialise logging")?;

    let metrics = MetricsRegistry::prometheus();
    let mut server = ServerService::new(ServiceConfig {
        server: args.server_config(),
        interceptors: args.interceptors(),
        metrics: metrics.clone(),
        ..ServiceConfig::default()
    })
    .context("invalid server configuration")?;

    server.with_health().add_route(Route::metrics(metrics));
    let addrs = server.start().await.context("failed to start server")?;
    info!(rpc.addr = %addrs.rpc, http.addr = %addrs.http, "rpcgate started");

    server
        .serve(shutdown_signal())
        .await
        .context("server failed")?;
    info!("rpcgate stopped");
    Ok(())
}
