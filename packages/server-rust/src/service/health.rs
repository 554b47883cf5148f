//! Standard gRPC health service, served through the interceptor pipeline and
//! mapped to `GET /v1/healthz` on the gateway.

use std::collections::HashSet;
use std::sync::Arc;

use http::Method;
use rpcgate_core::BoxError;
use serde_json::json;
use tokio::sync::watch;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

use super::call::CallMessage;
use super::rpc::{Pipeline, ResponseStream};
use crate::gateway::{GatewayContext, GatewayHandlerFunc, GatewayMux, GatewayReply};
use crate::network::HealthState;

pub const CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";
pub const WATCH_METHOD: &str = "/grpc.health.v1.Health/Watch";
/// Gateway path of the health check.
pub const HEALTHZ_PATH: &str = "/v1/healthz";

impl CallMessage for HealthCheckRequest {
    fn log_fields(&self) -> Vec<(&'static str, String)> {
        vec![("service", self.service.clone())]
    }
}

/// Health of the whole server, or of one registered service.
///
/// The empty service name and every registered name share the server's
/// state: `SERVING` while ready, `NOT_SERVING` otherwise. A watch ends once
/// the server starts draining.
#[derive(Clone)]
pub struct HealthService {
    pipeline: Pipeline,
    state: watch::Receiver<HealthState>,
    services: Arc<HashSet<String>>,
}

impl HealthService {
    #[must_use]
    pub fn new(
        pipeline: Pipeline,
        state: watch::Receiver<HealthState>,
        services: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            pipeline,
            state,
            services: Arc::new(services.into_iter().collect()),
        }
    }

    /// The tonic server, decoding messages up to `max_recv_msg_size` bytes.
    #[must_use]
    pub fn into_server(self, max_recv_msg_size: usize) -> HealthServer<Self> {
        HealthServer::new(self).max_decoding_message_size(max_recv_msg_size)
    }

    fn known(&self, service: &str) -> bool {
        service.is_empty() || self.services.contains(service)
    }
}

fn serving_status(state: HealthState) -> ServingStatus {
    if state.is_serving() {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    }
}

fn health_response(status: ServingStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: status.into(),
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    type WatchStream = ResponseStream<HealthCheckResponse>;

    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let known = self.known(&request.get_ref().service);
        let state = *self.state.borrow();
        self.pipeline
            .unary(CHECK_METHOD, request, move |_ctx, message| async move {
                if !known {
                    return Err(Status::not_found(format!(
                        "unknown service {}",
                        message.service
                    )));
                }
                Ok(Response::new(health_response(serving_status(state))))
            })
            .await
    }

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let known = self.known(&request.get_ref().service);
        let mut state = self.state.clone();
        self.pipeline
            .server_streaming(WATCH_METHOD, request, move |_message, mut stream| async move {
                if !known {
                    return stream
                        .send(health_response(ServingStatus::ServiceUnknown))
                        .await;
                }
                let token = stream.context().cancellation_token().clone();
                loop {
                    let current = *state.borrow_and_update();
                    stream.send(health_response(serving_status(current))).await?;
                    // the draining status is the last message of a watch
                    if matches!(current, HealthState::Draining | HealthState::Stopped) {
                        return Ok(());
                    }
                    tokio::select! {
                        changed = state.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                        () = token.cancelled() => return Ok(()),
                    }
                }
            })
            .await
    }
}

/// Binds `GET /v1/healthz` to the health check of the whole server.
#[must_use]
pub fn healthz_gateway() -> GatewayHandlerFunc {
    Box::new(
        |gateway: &GatewayContext, mux: &mut GatewayMux, channel: Channel| -> Result<(), BoxError> {
            let client = HealthClient::new(channel)
                .max_decoding_message_size(gateway.max_recv_msg_size);
            mux.handle(Method::GET, HEALTHZ_PATH, CHECK_METHOD, move |request| {
                let mut client = client.clone();
                async move {
                    let service = request.query("service").unwrap_or_default().to_owned();
                    let response = client
                        .check(request.into_request(HealthCheckRequest { service }))
                        .await?;
                    Ok::<_, Status>(GatewayReply::from_response(response, |reply| {
                        json!({ "status": reply.status().as_str_name() })
                    }))
                }
            })?;
            Ok(())
        },
    )
}
