//! tonic-facing entry points into the interceptor chain.
//!
//! Service implementations delegate each generated trait method to the
//! matching [`Pipeline`] method, passing the business handler as a closure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderValue};
use rpcgate_core::{metadata, RequestContext};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use super::call::{AsAny, CallMessage, MethodInfo, ServerStream, StreamCall, UnaryCall, UnaryReply};
use super::middleware::CallChain;
use super::stream::{HeaderSlot, Incoming, RpcStream, TonicServerStream, STREAM_BUFFER};

/// Response stream type for server-streaming and bidi methods.
pub type ResponseStream<T> = ReceiverStream<Result<T, Status>>;

/// Parses a `grpc-timeout` value: at most eight digits followed by one of
/// the units `H M S m u n`.
#[must_use]
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Builds the call context from tonic request metadata.
fn request_context(mut headers: HeaderMap, peer: Option<std::net::SocketAddr>) -> RequestContext {
    if !headers.contains_key(metadata::REMOTE_ADDR) {
        if let Some(value) = peer.and_then(|addr| HeaderValue::from_str(&addr.to_string()).ok()) {
            headers.insert(metadata::REMOTE_ADDR, value);
        }
    }
    let timeout = headers
        .get(metadata::GRPC_TIMEOUT)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout);

    let ctx = RequestContext::new(headers);
    match timeout {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    }
}

fn split_request<T>(request: Request<T>) -> (RequestContext, T) {
    let peer = request.remote_addr();
    let (metadata, _extensions, message) = request.into_parts();
    (request_context(metadata.into_headers(), peer), message)
}

fn with_metadata<T>(message: T, headers: HeaderMap) -> Response<T> {
    let mut response = Response::new(message);
    *response.metadata_mut() = MetadataMap::from_headers(headers);
    response
}

/// Runs tonic calls through one composed [`CallChain`].
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<CallChain>,
}

impl Pipeline {
    #[must_use]
    pub fn new(chain: CallChain) -> Self {
        Self {
            chain: Arc::new(chain),
        }
    }

    /// Runs a unary call.
    ///
    /// # Errors
    ///
    /// Returns the status produced by an interceptor or by `handler`.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: CallMessage,
        Resp: Send + 'static,
        F: FnOnce(RequestContext, Req) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Response<Resp>, Status>> + Send + 'static,
    {
        let (ctx, message) = split_request(request);
        // cancels the context when the call completes or tonic drops it
        let _cancel_on_exit = ctx.cancellation_token().clone().drop_guard();

        let call = UnaryCall::new(
            ctx,
            MethodInfo::unary(method),
            Box::new(message),
            move |ctx, message| -> BoxFuture<'static, Result<UnaryReply, Status>> {
                Box::pin(async move {
                    let message = message
                        .into_any()
                        .downcast::<Req>()
                        .map_err(|_| Status::internal("unexpected request message type"))?;
                    let (metadata, reply, _extensions) = handler(ctx, *message).await?.into_parts();
                    Ok(UnaryReply {
                        metadata: metadata.into_headers(),
                        message: Box::new(reply),
                    })
                })
            },
        );

        let reply = self.chain.unary(call).await?;
        let message = reply
            .message
            .downcast::<Resp>()
            .map_err(|_| Status::internal("unexpected response message type"))?;
        Ok(with_metadata(*message, reply.metadata))
    }

    /// Runs a server-streaming call. `handler` receives the request and the
    /// outbound stream.
    ///
    /// # Errors
    ///
    /// Returns the status produced before the first response message.
    pub async fn server_streaming<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<ResponseStream<Resp>>, Status>
    where
        Req: CallMessage,
        Resp: Send + 'static,
        F: FnOnce(Req, RpcStream<Req, Resp>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let (ctx, message) = split_request(request);
        self.spawn_streaming(
            ctx,
            MethodInfo::streaming(method, false, true),
            Incoming::Single(Some(message)),
            move |mut stream: RpcStream<Req, Resp>| async move {
                let request = stream
                    .message()
                    .await?
                    .ok_or_else(|| Status::internal("missing request message"))?;
                handler(request, stream).await
            },
        )
        .await
    }

    /// Runs a bidirectional streaming call.
    ///
    /// # Errors
    ///
    /// Returns the status produced before the first response message.
    pub async fn bidi_streaming<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Streaming<Req>>,
        handler: F,
    ) -> Result<Response<ResponseStream<Resp>>, Status>
    where
        Req: CallMessage,
        Resp: Send + 'static,
        F: FnOnce(RpcStream<Req, Resp>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let (ctx, incoming) = split_request(request);
        self.spawn_streaming(
            ctx,
            MethodInfo::streaming(method, true, true),
            Incoming::Streaming(incoming),
            handler,
        )
        .await
    }

    /// Runs a client-streaming call; `handler` produces the single reply.
    ///
    /// # Errors
    ///
    /// Returns the status produced by an interceptor or by `handler`.
    pub async fn client_streaming<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Streaming<Req>>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: CallMessage,
        Resp: Send + 'static,
        F: FnOnce(RpcStream<Req, Resp>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Response<Resp>, Status>> + Send + 'static,
    {
        let (ctx, incoming) = split_request(request);
        let _cancel_on_exit = ctx.cancellation_token().clone().drop_guard();

        let (header_tx, mut header_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let stream = TonicServerStream::<Req, Resp>::new(
            ctx,
            Incoming::Streaming(incoming),
            None,
            HeaderSlot::new(header_tx),
        );
        let call = StreamCall::new(
            MethodInfo::streaming(method, true, false),
            Box::new(stream),
            move |stream: Box<dyn ServerStream>| -> BoxFuture<'static, Result<(), Status>> {
                Box::pin(async move {
                    let response = handler(RpcStream::new(stream)).await?;
                    // receiver lives until the chain returns
                    let _ = reply_tx.send(response);
                    Ok(())
                })
            },
        );

        self.chain.stream(call).await?;
        let response = reply_rx
            .await
            .map_err(|_| Status::internal("handler produced no response"))?;
        match header_rx.try_recv() {
            Ok(Ok(extra)) => {
                let (metadata, message, extensions) = response.into_parts();
                let mut headers = metadata.into_headers();
                headers.extend(extra);
                Ok(Response::from_parts(
                    MetadataMap::from_headers(headers),
                    message,
                    extensions,
                ))
            }
            _ => Ok(response),
        }
    }

    /// Runs a streaming chain on its own task and returns once the handler
    /// sends headers, sends its first message, or fails.
    async fn spawn_streaming<Req, Resp, F, Fut>(
        &self,
        ctx: RequestContext,
        method: MethodInfo,
        incoming: Incoming<Req>,
        handler: F,
    ) -> Result<Response<ResponseStream<Resp>>, Status>
    where
        Req: CallMessage,
        Resp: Send + 'static,
        F: FnOnce(RpcStream<Req, Resp>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (header_tx, header_rx) = oneshot::channel();
        let header = HeaderSlot::new(header_tx);
        let token = ctx.cancellation_token().clone();

        let stream =
            TonicServerStream::<Req, Resp>::new(ctx, incoming, Some(tx.clone()), header.clone());
        let call = StreamCall::new(
            method,
            Box::new(stream),
            move |stream: Box<dyn ServerStream>| -> BoxFuture<'static, Result<(), Status>> {
                Box::pin(handler(RpcStream::new(stream)))
            },
        );

        let chain = Arc::clone(&self.chain);
        tokio::spawn(async move {
            let _cancel_on_exit = token.clone().drop_guard();
            let run = chain.stream(call);
            tokio::pin!(run);
            let result = tokio::select! {
                result = &mut run => result,
                () = tx.closed() => {
                    debug!("client went away, cancelling call context");
                    token.cancel();
                    run.await
                }
            };
            match result {
                Ok(()) => {
                    header.deliver(Ok(HeaderMap::new()));
                }
                // before headers the status answers the call itself, after
                // them it terminates the response stream
                Err(status) => {
                    if !header.deliver(Err(status.clone())) {
                        let _ = tx.send(Err(status)).await;
                    }
                }
            }
        });

        match header_rx.await {
            Ok(Ok(headers)) => Ok(with_metadata(ReceiverStream::new(rx), headers)),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::internal("streaming task ended unexpectedly")),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::service::call::tests::Ping;
    use crate::service::middleware::pipeline::ChainBuilder;
    use crate::service::middleware::{Next, ServerMiddleware};

    #[derive(Debug, Clone, PartialEq)]
    struct Pong(String);

    /// Sets the subject and rejects calls marked `deny`.
    struct Gate;

    #[async_trait]
    impl ServerMiddleware for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn unary(
            &self,
            call: UnaryCall,
            next: Next<UnaryCall, UnaryReply>,
        ) -> Result<UnaryReply, Status> {
            let ctx = call.ctx.with_subject("gatekeeper");
            next.run(call.with_context(ctx)).await
        }

        async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
            if call.context().metadata_value("deny").is_some() {
                return Err(Status::permission_denied("denied"));
            }
            let ctx = call.context().with_subject("gatekeeper");
            next.run(call.with_context(ctx)).await
        }
    }

    fn pipeline() -> Pipeline {
        let mut builder = ChainBuilder::bare();
        builder.push(Arc::new(Gate));
        Pipeline::new(builder.build())
    }

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("7u"), Some(Duration::from_micros(7)));
        assert_eq!(parse_grpc_timeout("9n"), Some(Duration::from_nanos(9)));
    }

    #[test]
    fn grpc_timeout_rejects_malformed_values() {
        for value in ["", "S", "10", "10x", "123456789S", "-1S", "1.5S", "5é"] {
            assert_eq!(parse_grpc_timeout(value), None, "{value}");
        }
    }

    #[tokio::test]
    async fn unary_runs_handler_with_enriched_context() {
        let mut request = Request::new(Ping("hello".into()));
        request
            .metadata_mut()
            .insert("grpc-timeout", "5S".parse().unwrap());
        request.metadata_mut().insert("x-extra", "1".parse().unwrap());

        let response = pipeline()
            .unary("/test.Echo/Call", request, |ctx, ping: Ping| async move {
                assert_eq!(ctx.subject(), Some("gatekeeper"));
                assert!(ctx.deadline().is_some());
                assert_eq!(ctx.metadata_value("x-extra"), Some("1"));
                let mut response = Response::new(Pong(ping.0));
                response
                    .metadata_mut()
                    .insert("x-request-id", "abc".parse().unwrap());
                Ok(response)
            })
            .await
            .unwrap();

        assert_eq!(response.metadata().get("x-request-id").unwrap(), "abc");
        assert_eq!(response.into_inner(), Pong("hello".into()));
    }

    #[tokio::test]
    async fn unary_context_is_cancelled_after_completion() {
        let (tx, rx) = oneshot::channel();
        pipeline()
            .unary("/test.Echo/Call", Request::new(Ping("x".into())), |ctx, _ping: Ping| async move {
                let _ = tx.send(ctx);
                Ok(Response::new(()))
            })
            .await
            .unwrap();
        let ctx = rx.await.unwrap();
        assert!(ctx.done().is_some());
    }

    #[tokio::test]
    async fn server_streaming_sends_all_messages() {
        let response = pipeline()
            .server_streaming(
                "/test.Echo/Stream",
                Request::new(Ping("n".into())),
                |ping: Ping, mut stream: RpcStream<Ping, Pong>| async move {
                    assert_eq!(stream.context().subject(), Some("gatekeeper"));
                    for i in 0..3 {
                        stream.send(Pong(format!("{}{i}", ping.0))).await?;
                    }
                    Ok(())
                },
            )
            .await
            .unwrap();

        let items: Vec<_> = response.into_inner().collect().await;
        let items: Vec<Pong> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec![Pong("n0".into()), Pong("n1".into()), Pong("n2".into())]);
    }

    #[tokio::test]
    async fn streaming_rejection_is_returned_as_call_status() {
        let mut request = Request::new(Ping("n".into()));
        request.metadata_mut().insert("deny", "1".parse().unwrap());
        let status = pipeline()
            .server_streaming(
                "/test.Echo/Stream",
                request,
                |_ping: Ping, _stream: RpcStream<Ping, Pong>| async move { Ok(()) },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn streaming_error_after_first_message_ends_stream() {
        let response = pipeline()
            .server_streaming(
                "/test.Echo/Stream",
                Request::new(Ping("n".into())),
                |_ping: Ping, mut stream: RpcStream<Ping, Pong>| async move {
                    stream.send(Pong("first".into())).await?;
                    Err(Status::aborted("mid-stream failure"))
                },
            )
            .await
            .unwrap();

        let items: Vec<_> = response.into_inner().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Pong("first".into()));
        assert_eq!(items[1].as_ref().unwrap_err().code(), tonic::Code::Aborted);
    }
}
