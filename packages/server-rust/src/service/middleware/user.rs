//! Advisory user-profile resolution.

use std::sync::Arc;

use async_trait::async_trait;
use rpcgate_core::{RequestContext, UserGetter, UserInfo};
use tonic::Status;
use tracing::warn;

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};

/// Attaches the caller's [`UserInfo`] to the context.
///
/// Never fails a call: a missing subject or a failed lookup stores the
/// anonymous profile instead.
#[derive(Clone)]
pub struct UserResolver {
    getter: Arc<dyn UserGetter>,
}

impl UserResolver {
    #[must_use]
    pub fn new(getter: Arc<dyn UserGetter>) -> Self {
        Self { getter }
    }

    async fn resolve(&self, ctx: &RequestContext) -> RequestContext {
        let Some(subject) = ctx.subject() else {
            return ctx.with_user_info(UserInfo::anonymous());
        };
        let user = match ctx.guard(self.getter.get_user(ctx, subject)).await {
            Ok(Ok(user)) => user,
            Ok(Err(err)) => {
                warn!(subject, error = %err, "user lookup failed, using anonymous profile");
                UserInfo::anonymous()
            }
            Err(done) => {
                warn!(subject, error = %done, "user lookup interrupted, using anonymous profile");
                UserInfo::anonymous()
            }
        };
        ctx.with_user_info(user)
    }
}

#[async_trait]
impl ServerMiddleware for UserResolver {
    fn name(&self) -> &str {
        "user"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let ctx = self.resolve(&call.ctx).await;
        next.run(call.with_context(ctx)).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let ctx = self.resolve(call.context()).await;
        next.run(call.with_context(ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use rpcgate_core::BoxError;

    use super::*;
    use crate::service::middleware::testing::{
        echo_call, echo_stream, run_echo, single, streamed_context,
    };

    struct Directory;

    #[async_trait]
    impl UserGetter for Directory {
        async fn get_user(&self, _ctx: &RequestContext, subject: &str) -> Result<UserInfo, BoxError> {
            match subject {
                "alice" => Ok(UserInfo {
                    id: "u-1".into(),
                    email: "alice@example.com".into(),
                    groups: vec!["admins".into()],
                }),
                _ => Err("user not found".into()),
            }
        }
    }

    fn chain() -> crate::service::middleware::CallChain {
        single(Arc::new(UserResolver::new(Arc::new(Directory))))
    }

    #[tokio::test]
    async fn known_subject_gets_profile() {
        let ctx = RequestContext::default().with_subject("alice");
        let ctx = run_echo(&chain(), echo_call(ctx)).await.unwrap();
        let user = ctx.user_info().unwrap();
        assert_eq!(user.id, "u-1");
        assert!(!user.is_anonymous());
    }

    #[tokio::test]
    async fn missing_subject_is_anonymous() {
        let ctx = run_echo(&chain(), echo_call(RequestContext::default()))
            .await
            .unwrap();
        assert_eq!(ctx.user_info(), Some(&UserInfo::anonymous()));
    }

    #[tokio::test]
    async fn lookup_failure_falls_back_without_error() {
        let ctx = RequestContext::default().with_subject("ghost");
        let ctx = run_echo(&chain(), echo_call(ctx)).await.unwrap();
        assert!(ctx.user_info().unwrap().is_anonymous());
    }

    #[tokio::test]
    async fn stream_context_carries_user() {
        let (call, sent) = echo_stream(RequestContext::default().with_subject("alice"));
        chain().stream(call).await.unwrap();
        assert_eq!(streamed_context(&sent).user_info().unwrap().email, "alice@example.com");
    }
}
