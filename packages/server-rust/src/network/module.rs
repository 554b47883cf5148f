//! Server lifecycle with deferred startup.
//!
//! `new()` composes the interceptor chain, `register_*` calls collect RPC
//! services and gateway bindings, `start()` binds both listeners and builds
//! the routers, and `serve()` runs until the shutdown signal fires.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;
use tower::Service;
use tracing::{info, warn};

use super::config::{ConfigError, ServerConfig, ServiceConfig};
use super::middleware::with_http_layers;
use super::shutdown::ShutdownController;
use crate::gateway::{self, GatewayConfig, GatewayContext, GatewayError, GatewayHandlerFunc, Route};
use crate::service::health::{healthz_gateway, HealthService};
use crate::service::middleware::ChainBuilder;
use crate::service::rpc::Pipeline;
use crate::telemetry::MetricsRegistry;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("gateway setup failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("reflection setup failed: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
    #[error("rpc transport failed: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("server task failed: {0}")]
    Task(#[from] JoinError),
    #[error("start() must be called before serve()")]
    NotStarted,
    #[error("server already started")]
    AlreadyStarted,
}

/// Addresses the listeners were bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAddrs {
    pub rpc: SocketAddr,
    pub http: SocketAddr,
}

struct Bound {
    rpc: TcpListener,
    http: TcpListener,
    routes: Routes,
    router: Router,
}

/// Serves registered RPC services on one listener and their gateway
/// bindings on another, sharing one interceptor chain.
///
/// 1. `new()` -- validates the configuration and composes the chain
/// 2. `start()` -- binds both listeners and builds the routers
/// 3. `serve()` -- runs both transports until shutdown is signalled
pub struct ServerService {
    config: ServerConfig,
    gateway: GatewayConfig,
    metrics: MetricsRegistry,
    pipeline: Pipeline,
    shutdown: Arc<ShutdownController>,
    routes: RoutesBuilder,
    service_names: Vec<String>,
    handlers: Vec<GatewayHandlerFunc>,
    static_routes: Vec<Route>,
    descriptor_sets: Vec<&'static [u8]>,
    health: bool,
    bound: Option<Bound>,
}

impl ServerService {
    /// # Errors
    ///
    /// Returns `Config` when the server configuration is invalid; nothing is
    /// bound in that case.
    pub fn new(config: ServiceConfig) -> Result<Self, ServerError> {
        config.server.validate()?;
        let chain = ChainBuilder::new(config.metrics.clone())
            .with(config.interceptors)
            .build();
        Ok(Self {
            config: config.server,
            gateway: config.gateway,
            metrics: config.metrics,
            pipeline: Pipeline::new(chain),
            shutdown: Arc::new(ShutdownController::new()),
            routes: RoutesBuilder::default(),
            service_names: Vec::new(),
            handlers: Vec::new(),
            static_routes: Vec::new(),
            descriptor_sets: Vec::new(),
            health: false,
            bound: None,
        })
    }

    /// The pipeline service implementations run their calls through.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        self.pipeline.clone()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Adds an RPC service and the gateway handlers that bind its routes.
    pub fn register_service<S>(
        &mut self,
        service: S,
        handlers: impl IntoIterator<Item = GatewayHandlerFunc>,
    ) -> &mut Self
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.service_names.push(S::NAME.to_string());
        self.routes.add_service(service);
        self.handlers.extend(handlers);
        self
    }

    /// Adds gateway handlers without an RPC service of their own.
    pub fn add_gateway_handlers(
        &mut self,
        handlers: impl IntoIterator<Item = GatewayHandlerFunc>,
    ) -> &mut Self {
        self.handlers.extend(handlers);
        self
    }

    /// Mounts a static HTTP route next to the gateway.
    pub fn add_route(&mut self, route: Route) -> &mut Self {
        self.static_routes.push(route);
        self
    }

    /// Encoded descriptor set served by reflection.
    pub fn register_file_descriptor_set(&mut self, encoded: &'static [u8]) -> &mut Self {
        self.descriptor_sets.push(encoded);
        self
    }

    /// Serves the standard health service for every registered service,
    /// and `GET /v1/healthz` on the gateway.
    pub fn with_health(&mut self) -> &mut Self {
        self.health = true;
        self
    }

    /// Binds both listeners and builds the RPC and HTTP routers.
    ///
    /// Port 0 binds an OS-assigned port; the returned addresses carry the
    /// actual ports.
    ///
    /// # Errors
    ///
    /// Returns an error when a listener cannot be bound, reflection cannot
    /// be built, or a gateway handler fails; nothing is served then.
    pub async fn start(&mut self) -> Result<ServerAddrs, ServerError> {
        if self.bound.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let rpc = bind(&self.config.host, self.config.rpc_port).await?;
        let http = bind(&self.config.host, self.config.http_port).await?;
        let addrs = ServerAddrs {
            rpc: rpc.local_addr()?,
            http: http.local_addr()?,
        };

        let mut routes = std::mem::take(&mut self.routes);
        if self.health {
            let health = HealthService::new(
                self.pipeline.clone(),
                self.shutdown.subscribe(),
                self.service_names.clone(),
            );
            routes.add_service(health.into_server(self.config.max_recv_msg_size));
            self.handlers.push(healthz_gateway());
            self.descriptor_sets.push(tonic_health::pb::FILE_DESCRIPTOR_SET);
        }
        if self.config.reflection {
            let mut reflection = tonic_reflection::server::Builder::configure();
            for set in self.descriptor_sets.iter().copied() {
                reflection = reflection.register_encoded_file_descriptor_set(set);
            }
            routes.add_service(reflection.build_v1()?);
        }

        let channel = gateway::dial(addrs.rpc)?;
        let context = GatewayContext {
            cancel: self.shutdown.token(),
            max_recv_msg_size: self.config.max_recv_msg_size,
        };
        let router = gateway::build_router(
            &self.gateway,
            &context,
            &channel,
            std::mem::take(&mut self.handlers),
            self.config.max_http_body,
        )?;
        let router = with_http_layers(
            router,
            &self.config,
            Arc::clone(&self.shutdown),
            Arc::clone(&self.gateway.outgoing),
        )?;
        let router = gateway::mount_routes(std::mem::take(&mut self.static_routes), router)?;

        info!(
            rpc.addr = %addrs.rpc,
            http.addr = %addrs.http,
            reflection = self.config.reflection,
            "listeners bound"
        );
        self.bound = Some(Bound {
            rpc,
            http,
            routes: routes.routes(),
            router,
        });
        Ok(addrs)
    }

    /// Serves both transports until `shutdown` resolves or one of them
    /// fails.
    ///
    /// Shutdown runs in two phases:
    /// 1. Health moves to Draining and the HTTP listener stops accepting;
    ///    in-flight HTTP calls get `shutdown_grace`, then are aborted
    /// 2. The RPC listener stops gracefully, bounded by the same grace
    ///
    /// Health moves to Stopped once no gateway request is in flight.
    ///
    /// # Errors
    ///
    /// Returns `NotStarted` without `start()`, otherwise the first
    /// transport failure.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let bound = self.bound.take().ok_or(ServerError::NotStarted)?;
        let grace = self.config.shutdown_grace;
        let controller = self.shutdown;

        let (stop_rpc, rpc_stopped) = oneshot::channel::<()>();
        let mut rpc: JoinHandle<Result<(), ServerError>> = tokio::spawn(async move {
            Server::builder()
                .add_routes(bound.routes)
                .serve_with_incoming_shutdown(TcpListenerStream::new(bound.rpc), async {
                    // a dropped sender also stops the server
                    let _ = rpc_stopped.await;
                })
                .await
                .map_err(ServerError::from)
        });

        let stop_http = controller.token();
        let mut http: JoinHandle<Result<(), ServerError>> = tokio::spawn(async move {
            axum::serve(
                bound.http,
                bound
                    .router
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(stop_http.cancelled_owned())
            .await
            .map_err(ServerError::from)
        });

        controller.set_ready();
        info!("serving rpc and http");

        let mut http_result = None;
        let mut rpc_result = None;
        tokio::select! {
            () = shutdown => info!("shutdown signal received"),
            joined = &mut http => {
                warn!("http server exited before shutdown");
                http_result = Some(flatten(joined));
            }
            joined = &mut rpc => {
                warn!("rpc server exited before shutdown");
                rpc_result = Some(flatten(joined));
            }
        }

        controller.trigger_shutdown();
        let http_result = match http_result {
            Some(result) => result,
            None => stop_within(grace, http, "http").await,
        };

        let _ = stop_rpc.send(());
        let rpc_result = match rpc_result {
            Some(result) => result,
            None => stop_within(grace, rpc, "rpc").await,
        };

        if controller.wait_for_drain(grace).await {
            info!("all in-flight requests drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with in-flight requests remaining"
            );
        }
        http_result.and(rpc_result)
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

fn flatten(joined: Result<Result<(), ServerError>, JoinError>) -> Result<(), ServerError> {
    joined?
}

/// Awaits `task` for up to `grace`, aborting it afterwards.
async fn stop_within(
    grace: std::time::Duration,
    mut task: JoinHandle<Result<(), ServerError>>,
    transport: &'static str,
) -> Result<(), ServerError> {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(joined) => {
            info!(transport, "server stopped");
            flatten(joined)
        }
        Err(_) => {
            warn!(
                transport,
                grace_secs = grace.as_secs(),
                "graceful stop exceeded grace period, aborting"
            );
            task.abort();
            Ok(())
        }
    }
}
