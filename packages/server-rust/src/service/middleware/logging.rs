//! Call logging unit and context-correlated log helpers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rpcgate_core::RequestContext;
use tonic::{Code, Status};
use tracing::{debug, error, info, info_span, warn, Level, Span};

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};

/// Log level for a call that finished with `code`.
#[must_use]
pub fn level_for(code: Code) -> Level {
    match code {
        Code::Ok => Level::DEBUG,
        Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Level::INFO,
        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Level::WARN,
        Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Level::ERROR,
    }
}

/// A span carrying the call's request id and subject, for handlers that
/// want their own events correlated with the call.
#[must_use]
pub fn context_span(ctx: &RequestContext) -> Span {
    info_span!(
        "call",
        request_id = ctx.request_id().unwrap_or(""),
        subject = ctx.subject().unwrap_or(""),
    )
}

fn log_call(method: &str, kind: &'static str, elapsed: Duration, status: Option<&Status>) {
    let code = status.map_or(Code::Ok, Status::code);
    #[allow(clippy::cast_possible_truncation)]
    let time_ms = elapsed.as_millis() as u64;
    let message = status.map_or("", Status::message);

    let level = level_for(code);
    if level == Level::ERROR {
        error!(grpc.method = method, grpc.kind = kind, grpc.code = ?code, grpc.time_ms = time_ms, error = message, "finished call");
    } else if level == Level::WARN {
        warn!(grpc.method = method, grpc.kind = kind, grpc.code = ?code, grpc.time_ms = time_ms, error = message, "finished call");
    } else if level == Level::INFO {
        info!(grpc.method = method, grpc.kind = kind, grpc.code = ?code, grpc.time_ms = time_ms, error = message, "finished call");
    } else {
        debug!(grpc.method = method, grpc.kind = kind, grpc.code = ?code, grpc.time_ms = time_ms, "finished call");
    }
}

/// Emits one structured event per call, levelled by response code, inside
/// the call's [`context_span`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl ServerMiddleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let method = call.method.full_method.clone();
        let span = context_span(&call.ctx);
        let start = Instant::now();
        let result = next.run(call).await;
        span.in_scope(|| log_call(&method, "unary", start.elapsed(), result.as_ref().err()));
        result
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let method = call.method.full_method.clone();
        let span = context_span(call.context());
        let start = Instant::now();
        let result = next.run(call).await;
        span.in_scope(|| log_call(&method, "stream", start.elapsed(), result.as_ref().err()));
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::service::middleware::testing::{echo_call, run_echo, single};

    #[test]
    fn levels_follow_code_severity() {
        assert_eq!(level_for(Code::Ok), Level::DEBUG);
        for code in [
            Code::Cancelled,
            Code::InvalidArgument,
            Code::NotFound,
            Code::AlreadyExists,
            Code::Unauthenticated,
        ] {
            assert_eq!(level_for(code), Level::INFO, "{code:?}");
        }
        for code in [
            Code::DeadlineExceeded,
            Code::PermissionDenied,
            Code::ResourceExhausted,
            Code::FailedPrecondition,
            Code::Aborted,
            Code::OutOfRange,
            Code::Unavailable,
        ] {
            assert_eq!(level_for(code), Level::WARN, "{code:?}");
        }
        for code in [Code::Unknown, Code::Unimplemented, Code::Internal, Code::DataLoss] {
            assert_eq!(level_for(code), Level::ERROR, "{code:?}");
        }
    }

    #[test]
    fn context_span_builds_without_values() {
        let _span = context_span(&RequestContext::default());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn finished_call_event_carries_request_id() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let chain = single(Arc::new(LoggingMiddleware));
        let ctx = RequestContext::default()
            .with_request_id("req-42")
            .with_subject("alice");
        run_echo(&chain, echo_call(ctx)).await.unwrap();

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("finished call"), "{output}");
        assert!(output.contains("req-42"), "{output}");
        assert!(output.contains("alice"), "{output}");
    }
}
