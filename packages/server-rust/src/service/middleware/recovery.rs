//! Fault isolation: turns a panic in the handler (or a guarded unit) into an
//! `Unknown` status for that call only.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::FutureExt;
use tonic::Status;
use tower::Service;
use tracing::error;

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};

/// Message returned to the caller; panic details stay in the logs.
pub const PANIC_MESSAGE: &str = "panic triggered";

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chains a panic hook that keeps the panicking thread's backtrace so the
/// recovery log can include it.
fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Awaits `fut`, converting a panic into an `Unknown` status.
///
/// # Errors
///
/// Returns the future's own error, or `Unknown` when it panicked.
pub async fn recover<T, F>(unit: &str, fut: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    install_backtrace_hook();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let payload = match payload.downcast::<Downstream>() {
                Ok(downstream) => resume_unwind(downstream.0),
                Err(payload) => payload,
            };
            let backtrace = LAST_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .map(|bt| bt.to_string())
                .unwrap_or_default();
            error!(
                unit = unit,
                panic = %panic_message(payload.as_ref()),
                backtrace = %backtrace,
                "recovered from panic"
            );
            Err(Status::unknown(PANIC_MESSAGE))
        }
    }
}

/// Panic raised below a guarded unit, on its way to the layers above it.
struct Downstream(Box<dyn Any + Send>);

/// The `next` service handed to a guarded unit. A panic below it is marked,
/// so the unit's guard lets it continue unwinding instead of recovering it.
#[derive(Clone)]
pub(crate) struct PassThrough<S>(pub(crate) S);

impl<S, Req> Service<Req> for PassThrough<S>
where
    S: Service<Req, Error = Status>,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, Status>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Status>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        let fut = self.0.call(request);
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => resume_unwind(Box::new(Downstream(payload))),
            }
        })
    }
}

/// Innermost unit, directly around the business handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryMiddleware;

#[async_trait]
impl ServerMiddleware for RecoveryMiddleware {
    fn name(&self) -> &str {
        "recovery"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        recover("handler", next.run(call)).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        recover("handler", next.run(call)).await
    }
}
