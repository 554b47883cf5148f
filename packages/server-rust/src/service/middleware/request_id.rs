//! Request-id assignment.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderValue;
use rpcgate_core::{metadata, RequestContext};
use tonic::Status;
use tracing::Span;
use uuid::Uuid;

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};

/// Source of request identifiers.
pub trait RequestIdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Random (v4) UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl RequestIdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Stamps every call with a freshly generated request id.
///
/// Unary replies echo the id in `x-request-id` response metadata, which the
/// gateway's default outgoing matcher forwards to HTTP clients.
#[derive(Clone)]
pub struct RequestIdResolver {
    generator: Arc<dyn RequestIdGenerator>,
}

impl Default for RequestIdResolver {
    fn default() -> Self {
        Self::new(Arc::new(UuidGenerator))
    }
}

impl RequestIdResolver {
    #[must_use]
    pub fn new(generator: Arc<dyn RequestIdGenerator>) -> Self {
        Self { generator }
    }

    fn assign(&self, ctx: &RequestContext) -> (RequestContext, String) {
        let id = self.generator.generate();
        Span::current().record("request_id", id.as_str());
        (ctx.with_request_id(id.clone()), id)
    }
}

#[async_trait]
impl ServerMiddleware for RequestIdResolver {
    fn name(&self) -> &str {
        "request_id"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let (ctx, id) = self.assign(&call.ctx);
        let mut reply = next.run(call.with_context(ctx)).await?;
        if let Ok(value) = HeaderValue::from_str(&id) {
            reply.metadata.insert(metadata::X_REQUEST_ID, value);
        }
        Ok(reply)
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let (ctx, _) = self.assign(call.context());
        next.run(call.with_context(ctx)).await
    }
}
