//! Interceptor units and their tower adapter.
//!
//! A [`ServerMiddleware`] handles both call kinds. [`MiddlewareLayer`] turns
//! one unit into a tower layer, and [`pipeline`] stacks the fixed units
//! around the caller-supplied ones.
//!
//! - [`tags`]: call tags and the per-call span
//! - [`metrics`]: request duration and status code counters
//! - [`logging`]: one structured log line per call
//! - [`recovery`]: panic isolation around the business handler
//! - [`rate_limit`]: admission control
//! - [`authn`], [`authz`]: authentication and authorization
//! - [`request_id`], [`user`], [`project`]: identity resolvers

pub mod authn;
pub mod authz;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod project;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod tags;
pub mod user;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use rpcgate_core::RequestContext;
use tonic::Status;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};

use crate::service::call::{StreamCall, UnaryCall, UnaryReply};

pub use authn::{AuthnMiddleware, BearerTokenParser};
pub use authz::{AuthzConfig, AuthzMiddleware, SkipPath};
pub use logging::LoggingMiddleware;
pub use metrics::MetricsMiddleware;
pub use pipeline::{CallChain, ChainBuilder};
pub use project::{MessageProjectId, PathProjectId, ProjectIdSource, ProjectResolver};
pub use rate_limit::{Limiter, NoLimiter, RateLimitMiddleware};
pub use recovery::RecoveryMiddleware;
pub use request_id::{RequestIdGenerator, RequestIdResolver, UuidGenerator};
pub use tags::{CallTags, TagsMiddleware};
pub use user::UserResolver;

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Boxed downstream service for one call kind.
pub type BoxCallService<Req, Resp> = BoxCloneSyncService<Req, Resp, Status>;

/// The remainder of the chain, handed to a unit.
pub struct Next<Req, Resp> {
    inner: BoxCallService<Req, Resp>,
}

impl<Req, Resp> Next<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    #[must_use]
    pub fn new(inner: BoxCallService<Req, Resp>) -> Self {
        Self { inner }
    }

    /// Passes the call down the chain.
    ///
    /// # Errors
    ///
    /// Returns whatever status the downstream units or handler produce.
    pub async fn run(self, call: Req) -> Result<Resp, Status> {
        self.inner.oneshot(call).await
    }
}

// ---------------------------------------------------------------------------
// ServerMiddleware
// ---------------------------------------------------------------------------

/// One unit of cross-cutting call handling.
///
/// Both methods default to passing the call through, so a unit only
/// overrides the call kinds it cares about.
#[async_trait]
pub trait ServerMiddleware: Send + Sync + 'static {
    /// Short name used in traces and logs.
    fn name(&self) -> &str;

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        next.run(call).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        next.run(call).await
    }
}

// ---------------------------------------------------------------------------
// CallTrace
// ---------------------------------------------------------------------------

/// Records the names of the units a call passes through, in order.
///
/// Attach it as a context extension before the call enters the chain.
#[derive(Debug, Clone, Default)]
pub struct CallTrace(Arc<Mutex<Vec<String>>>);

impl CallTrace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, unit: &str) {
        self.0.lock().push(unit.to_string());
    }

    #[must_use]
    pub fn units(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

fn trace_unit(ctx: &RequestContext, unit: &str) {
    if let Some(trace) = ctx.extension::<CallTrace>() {
        trace.record(unit);
    }
}

// ---------------------------------------------------------------------------
// MiddlewareLayer
// ---------------------------------------------------------------------------

/// Tower layer that runs one [`ServerMiddleware`] in front of the inner
/// service.
///
/// A guarded layer also isolates panics raised by the unit itself.
#[derive(Clone)]
pub struct MiddlewareLayer {
    unit: Arc<dyn ServerMiddleware>,
    guarded: bool,
}

impl MiddlewareLayer {
    #[must_use]
    pub fn new(unit: Arc<dyn ServerMiddleware>) -> Self {
        Self {
            unit,
            guarded: false,
        }
    }

    /// Like [`MiddlewareLayer::new`], converting a panic inside the unit
    /// into an `Unknown` status.
    #[must_use]
    pub fn guarded(unit: Arc<dyn ServerMiddleware>) -> Self {
        Self {
            unit,
            guarded: true,
        }
    }
}

impl<S> Layer<S> for MiddlewareLayer {
    type Service = MiddlewareService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MiddlewareService {
            inner,
            unit: Arc::clone(&self.unit),
            guarded: self.guarded,
        }
    }
}

// ---------------------------------------------------------------------------
// MiddlewareService
// ---------------------------------------------------------------------------

/// Service wrapper produced by [`MiddlewareLayer`].
#[derive(Clone)]
pub struct MiddlewareService<S> {
    inner: S,
    unit: Arc<dyn ServerMiddleware>,
    guarded: bool,
}

impl<S> MiddlewareService<S>
where
    S: Clone,
{
    /// Takes the inner service, leaving a clone in its place.
    fn take_inner(&mut self) -> S {
        let clone = self.inner.clone();
        std::mem::replace(&mut self.inner, clone)
    }

    /// The rest of the chain as seen by the unit. Below a guarded unit,
    /// panics are passed through its guard untouched.
    fn next<Req, Resp>(&mut self) -> Next<Req, Resp>
    where
        S: Service<Req, Response = Resp, Error = Status> + Send + Sync + 'static,
        S::Future: Send + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let inner = self.take_inner();
        if self.guarded {
            Next::new(BoxCloneSyncService::new(recovery::PassThrough(inner)))
        } else {
            Next::new(BoxCloneSyncService::new(inner))
        }
    }
}

impl<S> Service<UnaryCall> for MiddlewareService<S>
where
    S: Service<UnaryCall, Response = UnaryReply, Error = Status> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = UnaryReply;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<UnaryReply, Status>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: UnaryCall) -> Self::Future {
        let next = self.next();
        let unit = Arc::clone(&self.unit);
        let guarded = self.guarded;

        Box::pin(async move {
            trace_unit(&call.ctx, unit.name());
            let fut = unit.unary(call, next);
            if guarded {
                recovery::recover(unit.name(), fut).await
            } else {
                fut.await
            }
        })
    }
}

impl<S> Service<StreamCall> for MiddlewareService<S>
where
    S: Service<StreamCall, Response = (), Error = Status> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<(), Status>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: StreamCall) -> Self::Future {
        let next = self.next();
        let unit = Arc::clone(&self.unit);
        let guarded = self.guarded;

        Box::pin(async move {
            trace_unit(call.context(), unit.name());
            let fut = unit.stream(call, next);
            if guarded {
                recovery::recover(unit.name(), fut).await
            } else {
                fut.await
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------
