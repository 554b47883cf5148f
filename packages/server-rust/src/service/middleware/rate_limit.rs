//! Admission control through an external [`Limiter`].

use std::sync::Arc;

use async_trait::async_trait;
use rpcgate_core::BoxError;
use tonic::Status;

use super::{Next, ServerMiddleware};
use crate::service::call::{CallMessage, StreamCall, UnaryCall, UnaryReply};

/// Decides whether a call may proceed. Streaming calls pass no message.
pub trait Limiter: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the call must be rejected.
    fn limit(&self, method: &str, message: Option<&dyn CallMessage>) -> Result<(), BoxError>;
}

/// Admits every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimiter;

impl Limiter for NoLimiter {
    fn limit(&self, _method: &str, _message: Option<&dyn CallMessage>) -> Result<(), BoxError> {
        Ok(())
    }
}

fn rejected(method: &str, err: &BoxError) -> Status {
    Status::resource_exhausted(format!(
        "{method} too many requests, please retry later. details: {err}"
    ))
}

/// Rejects calls refused by the limiter with `ResourceExhausted`.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<dyn Limiter>,
}

impl RateLimitMiddleware {
    #[must_use]
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl ServerMiddleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let method = &call.method.full_method;
        if let Err(err) = self.limiter.limit(method, Some(call.message.as_ref())) {
            return Err(rejected(method, &err));
        }
        next.run(call).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let method = &call.method.full_method;
        if let Err(err) = self.limiter.limit(method, None) {
            return Err(rejected(method, &err));
        }
        next.run(call).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rpcgate_core::RequestContext;

    use super::*;
    use crate::service::call::tests::Ping;
    use crate::service::middleware::testing::{echo_call, echo_stream, run_echo, single};

    /// Admits `budget` calls, then rejects.
    struct Budget {
        remaining: AtomicU32,
        saw_message: AtomicU32,
    }

    impl Limiter for Budget {
        fn limit(&self, _method: &str, message: Option<&dyn CallMessage>) -> Result<(), BoxError> {
            if message.and_then(|m| m.downcast_ref::<Ping>()).is_some() {
                self.saw_message.fetch_add(1, Ordering::Relaxed);
            }
            self.remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .map(|_| ())
                .map_err(|_| "budget exhausted".into())
        }
    }

    #[tokio::test]
    async fn rejects_once_limiter_refuses() {
        let limiter = Arc::new(Budget {
            remaining: AtomicU32::new(1),
            saw_message: AtomicU32::new(0),
        });
        let chain = single(Arc::new(RateLimitMiddleware::new(limiter.clone())));

        run_echo(&chain, echo_call(RequestContext::default()))
            .await
            .unwrap();
        let status = run_echo(&chain, echo_call(RequestContext::default()))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(
            status.message(),
            "/test.Echo/Call too many requests, please retry later. details: budget exhausted"
        );
        assert_eq!(limiter.saw_message.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn stream_calls_pass_no_message() {
        let limiter = Arc::new(Budget {
            remaining: AtomicU32::new(5),
            saw_message: AtomicU32::new(0),
        });
        let chain = single(Arc::new(RateLimitMiddleware::new(limiter.clone())));
        let (call, _sent) = echo_stream(RequestContext::default());
        chain.stream(call).await.unwrap();
        assert_eq!(limiter.saw_message.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn no_limiter_admits_everything() {
        let chain = single(Arc::new(RateLimitMiddleware::new(Arc::new(NoLimiter))));
        for _ in 0..10 {
            run_echo(&chain, echo_call(RequestContext::default()))
                .await
                .unwrap();
        }
    }
}
