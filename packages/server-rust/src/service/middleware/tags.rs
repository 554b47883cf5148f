//! Tag extraction: records call tags in the context and opens the call span.

use async_trait::async_trait;
use rpcgate_core::RequestContext;
use tonic::Status;
use tracing::{info_span, Instrument, Span};

use super::{Next, ServerMiddleware};
use crate::service::call::{CallMessage, MethodInfo, StreamCall, UnaryCall, UnaryReply};

/// Fields describing one call, available to every later unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallTags {
    pub service: String,
    pub method: String,
    pub peer: Option<String>,
    /// Fields exposed by the request message, unary calls only.
    pub fields: Vec<(&'static str, String)>,
}

impl CallTags {
    fn collect(ctx: &RequestContext, method: &MethodInfo, message: Option<&dyn CallMessage>) -> Self {
        Self {
            service: method.service().to_string(),
            method: method.method().to_string(),
            peer: ctx.remote_addr().map(str::to_owned),
            fields: message.map(CallMessage::log_fields).unwrap_or_default(),
        }
    }

    fn span(&self) -> Span {
        info_span!(
            "rpc",
            grpc.service = %self.service,
            grpc.method = %self.method,
            peer.address = self.peer.as_deref().unwrap_or(""),
            fields = ?self.fields,
            request_id = tracing::field::Empty,
            subject = tracing::field::Empty,
        )
    }
}

/// Outermost unit: tags every call, including rejected ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagsMiddleware;

#[async_trait]
impl ServerMiddleware for TagsMiddleware {
    fn name(&self) -> &str {
        "tags"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let tags = CallTags::collect(&call.ctx, &call.method, Some(call.message.as_ref()));
        let span = tags.span();
        let ctx = call.ctx.with_extension(tags);
        next.run(call.with_context(ctx)).instrument(span).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let tags = CallTags::collect(call.context(), &call.method, None);
        let span = tags.span();
        let ctx = call.context().with_extension(tags);
        next.run(call.with_context(ctx)).instrument(span).await
    }
}
