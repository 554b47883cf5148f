//! Chain composition: stacks the fixed units around the caller-supplied ones.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tonic::Status;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};

use super::logging::LoggingMiddleware;
use super::metrics::MetricsMiddleware;
use super::recovery::RecoveryMiddleware;
use super::tags::TagsMiddleware;
use super::{BoxCallService, MiddlewareLayer, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};
use crate::telemetry::MetricsRegistry;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Innermost service: runs the endpoint carried by the call.
#[derive(Debug, Clone, Copy)]
struct Dispatch;

impl Service<UnaryCall> for Dispatch {
    type Response = UnaryReply;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<UnaryReply, Status>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: UnaryCall) -> Self::Future {
        call.dispatch()
    }
}

impl Service<StreamCall> for Dispatch {
    type Response = ();
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<(), Status>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: StreamCall) -> Self::Future {
        call.dispatch()
    }
}

// ---------------------------------------------------------------------------
// CallChain
// ---------------------------------------------------------------------------

/// The composed handlers for both call kinds. Built once, then shared.
#[derive(Clone)]
pub struct CallChain {
    unary: BoxCallService<UnaryCall, UnaryReply>,
    stream: BoxCallService<StreamCall, ()>,
}

impl CallChain {
    /// Runs a single-shot call through the chain.
    ///
    /// # Errors
    ///
    /// Returns the status produced by a rejecting unit or by the handler.
    pub async fn unary(&self, call: UnaryCall) -> Result<UnaryReply, Status> {
        self.unary.clone().oneshot(call).await
    }

    /// Runs a streaming call through the chain.
    ///
    /// # Errors
    ///
    /// Returns the status produced by a rejecting unit or by the handler.
    pub async fn stream(&self, call: StreamCall) -> Result<(), Status> {
        self.stream.clone().oneshot(call).await
    }
}

// ---------------------------------------------------------------------------
// ChainBuilder
// ---------------------------------------------------------------------------

/// Builds a [`CallChain`] from caller-supplied units.
///
/// Layer order (outermost to innermost):
/// 1. `tags` -- call tags and the per-call span
/// 2. `metrics` -- duration and code counters
/// 3. caller-supplied units, in the order they were pushed
/// 4. `logging` -- one structured line per call
/// 5. `recovery` -- panic isolation, directly around the handler
///
/// Caller-supplied units are additionally guarded against their own
/// panics. The fixed `tags`, `metrics` and `logging` units are not.
pub struct ChainBuilder {
    units: Vec<Arc<dyn ServerMiddleware>>,
    metrics: Option<MetricsRegistry>,
}

impl ChainBuilder {
    #[must_use]
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            units: Vec::new(),
            metrics: Some(metrics),
        }
    }

    /// A builder without the fixed units, for exercising single units.
    #[cfg(test)]
    pub(crate) fn bare() -> Self {
        Self {
            units: Vec::new(),
            metrics: None,
        }
    }

    /// Appends a caller-supplied unit.
    pub fn push(&mut self, unit: Arc<dyn ServerMiddleware>) -> &mut Self {
        self.units.push(unit);
        self
    }

    #[must_use]
    pub fn with(mut self, units: impl IntoIterator<Item = Arc<dyn ServerMiddleware>>) -> Self {
        self.units.extend(units);
        self
    }

    /// Composes the chain. Runs once per server.
    #[must_use]
    pub fn build(&self) -> CallChain {
        let layers = self.layers();
        CallChain {
            unary: compose::<UnaryCall, UnaryReply>(&layers),
            stream: compose::<StreamCall, ()>(&layers),
        }
    }

    fn layers(&self) -> Vec<MiddlewareLayer> {
        let mut layers = Vec::with_capacity(self.units.len() + 4);
        let Some(metrics) = &self.metrics else {
            layers.extend(self.units.iter().cloned().map(MiddlewareLayer::guarded));
            return layers;
        };

        layers.push(MiddlewareLayer::new(Arc::new(TagsMiddleware)));
        layers.push(MiddlewareLayer::new(Arc::new(MetricsMiddleware::new(
            metrics.clone(),
        ))));
        layers.extend(self.units.iter().cloned().map(MiddlewareLayer::guarded));
        layers.push(MiddlewareLayer::new(Arc::new(LoggingMiddleware)));
        layers.push(MiddlewareLayer::new(Arc::new(RecoveryMiddleware)));
        layers
    }
}

/// Wraps [`Dispatch`] in `layers`, first layer outermost.
fn compose<Req, Resp>(layers: &[MiddlewareLayer]) -> BoxCallService<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    Dispatch: Service<Req, Response = Resp, Error = Status>,
    <Dispatch as Service<Req>>::Future: Send + 'static,
    super::MiddlewareService<BoxCallService<Req, Resp>>:
        Service<Req, Response = Resp, Error = Status> + Clone + Send + Sync + 'static,
    <super::MiddlewareService<BoxCallService<Req, Resp>> as Service<Req>>::Future: Send + 'static,
{
    let mut service = BoxCloneSyncService::new(Dispatch);
    for layer in layers.iter().rev() {
        service = BoxCloneSyncService::new(layer.layer(service));
    }
    service
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
