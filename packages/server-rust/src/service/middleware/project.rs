//! Project resolution: extract a project id, look the project up, store a
//! [`ProjectHandle`].

use std::sync::Arc;

use async_trait::async_trait;
use rpcgate_core::{project_id_from_path, ProjectGetter, ProjectHandle, RequestContext};
use tonic::Status;
use tracing::debug;

use super::{Next, ServerMiddleware};
use crate::service::call::{CallMessage, StreamCall, UnaryCall, UnaryReply};

/// Strategy for finding the project id of a call. Streaming calls pass no
/// message.
pub trait ProjectIdSource: Send + Sync {
    fn project_id(&self, ctx: &RequestContext, message: Option<&dyn CallMessage>)
        -> Option<String>;
}

/// Reads `/projects/{id}` from the gateway's `http-path` metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathProjectId;

impl ProjectIdSource for PathProjectId {
    fn project_id(&self, ctx: &RequestContext, _message: Option<&dyn CallMessage>) -> Option<String> {
        ctx.http_path()
            .and_then(project_id_from_path)
            .map(str::to_owned)
    }
}

/// Reads the id from the request message's [`CallMessage::project_id`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageProjectId;

impl ProjectIdSource for MessageProjectId {
    fn project_id(&self, _ctx: &RequestContext, message: Option<&dyn CallMessage>) -> Option<String> {
        message
            .and_then(CallMessage::project_id)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
    }
}

/// Stores the call's project in the context.
///
/// Resolution never fails the call; when the id is missing or the lookup
/// fails the handle is [`ProjectHandle::Invalid`] and its accessors report
/// `BadParameters`.
#[derive(Clone)]
pub struct ProjectResolver {
    source: Arc<dyn ProjectIdSource>,
    getter: Arc<dyn ProjectGetter>,
}

impl ProjectResolver {
    #[must_use]
    pub fn new(source: Arc<dyn ProjectIdSource>, getter: Arc<dyn ProjectGetter>) -> Self {
        Self { source, getter }
    }

    /// Path-based resolution.
    #[must_use]
    pub fn from_path(getter: Arc<dyn ProjectGetter>) -> Self {
        Self::new(Arc::new(PathProjectId), getter)
    }

    async fn resolve(&self, ctx: &RequestContext, message: Option<&dyn CallMessage>) -> RequestContext {
        let Some(id) = self.source.project_id(ctx, message) else {
            debug!("no project id for call");
            return ctx.with_project(ProjectHandle::Invalid);
        };
        let handle = match ctx.guard(self.getter.get_project(ctx, &id)).await {
            Ok(Ok(project)) => ProjectHandle::Resolved(project),
            Ok(Err(err)) => {
                debug!(project_id = %id, error = %err, "project lookup failed");
                ProjectHandle::Invalid
            }
            Err(done) => {
                debug!(project_id = %id, error = %done, "project lookup interrupted");
                ProjectHandle::Invalid
            }
        };
        ctx.with_project(handle)
    }
}

#[async_trait]
impl ServerMiddleware for ProjectResolver {
    fn name(&self) -> &str {
        "project"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let ctx = self.resolve(&call.ctx, Some(call.message.as_ref())).await;
        next.run(call.with_context(ctx)).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let ctx = self.resolve(call.context(), None).await;
        next.run(call.with_context(ctx)).await
    }
}
