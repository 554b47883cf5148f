//! Call envelopes that flow through the interceptor chain.
//!
//! A [`UnaryCall`] carries one request message; a [`StreamCall`] carries a
//! bidirectional [`ServerStream`]. Both carry the endpoint that finally runs
//! the business handler, so a single chain serves every method.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use http::HeaderMap;
use rpcgate_core::RequestContext;
use tonic::Status;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Object-safe upcast helpers, implemented for every sized message type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A request message that can travel through the chain.
///
/// Both methods are optional capabilities. `project_id` lets the project
/// resolver read the id straight from the message; `log_fields` adds
/// message fields to the call's tags.
pub trait CallMessage: AsAny + fmt::Debug {
    fn project_id(&self) -> Option<&str> {
        None
    }

    fn log_fields(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

impl dyn CallMessage {
    /// Borrows the message as its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Type-erased reply message.
pub type AnyMessage = Box<dyn Any + Send>;

/// Static description of the invoked method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// `/package.Service/Method`.
    pub full_method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodInfo {
    #[must_use]
    pub fn unary(full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
            client_streaming: false,
            server_streaming: false,
        }
    }

    #[must_use]
    pub fn streaming(
        full_method: impl Into<String>,
        client_streaming: bool,
        server_streaming: bool,
    ) -> Self {
        Self {
            full_method: full_method.into(),
            client_streaming,
            server_streaming,
        }
    }

    /// The `package.Service` part of the method name.
    #[must_use]
    pub fn service(&self) -> &str {
        let trimmed = self.full_method.trim_start_matches('/');
        trimmed.split_once('/').map_or(trimmed, |(svc, _)| svc)
    }

    /// The bare method name.
    #[must_use]
    pub fn method(&self) -> &str {
        self.full_method
            .rsplit_once('/')
            .map_or(self.full_method.as_str(), |(_, m)| m)
    }
}

// ---------------------------------------------------------------------------
// UnaryCall
// ---------------------------------------------------------------------------

type UnaryEndpoint = Box<
    dyn FnOnce(RequestContext, Box<dyn CallMessage>) -> BoxFuture<'static, Result<UnaryReply, Status>>
        + Send,
>;

/// Reply of a single-shot call: response metadata plus the message.
pub struct UnaryReply {
    pub metadata: HeaderMap,
    pub message: AnyMessage,
}

impl UnaryReply {
    #[must_use]
    pub fn new<T: Any + Send>(message: T) -> Self {
        Self {
            metadata: HeaderMap::new(),
            message: Box::new(message),
        }
    }
}

impl fmt::Debug for UnaryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryReply")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A single-shot call on its way to the business handler.
pub struct UnaryCall {
    pub ctx: RequestContext,
    pub method: MethodInfo,
    pub message: Box<dyn CallMessage>,
    endpoint: UnaryEndpoint,
}

impl UnaryCall {
    pub fn new<F>(
        ctx: RequestContext,
        method: MethodInfo,
        message: Box<dyn CallMessage>,
        endpoint: F,
    ) -> Self
    where
        F: FnOnce(RequestContext, Box<dyn CallMessage>) -> BoxFuture<'static, Result<UnaryReply, Status>>
            + Send
            + 'static,
    {
        Self {
            ctx,
            method,
            message,
            endpoint: Box::new(endpoint),
        }
    }

    /// Replaces the call's context with a derived one.
    #[must_use]
    pub fn with_context(mut self, ctx: RequestContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Runs the business handler with the call's current context.
    pub fn dispatch(self) -> BoxFuture<'static, Result<UnaryReply, Status>> {
        (self.endpoint)(self.ctx, self.message)
    }
}

impl fmt::Debug for UnaryCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryCall")
            .field("method", &self.method.full_method)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Server side of a streaming call.
#[async_trait]
pub trait ServerStream: Send {
    /// The context handlers should use for this call.
    fn context(&self) -> &RequestContext;

    /// Receives the next client message; `None` once the client is done.
    async fn recv(&mut self) -> Result<Option<Box<dyn CallMessage>>, Status>;

    /// Sends one message to the client.
    async fn send(&mut self, message: AnyMessage) -> Result<(), Status>;

    /// Sets response header metadata. Only effective before the first send.
    fn set_header(&mut self, metadata: HeaderMap) -> Result<(), Status>;
}

/// Stream wrapper whose context accessor returns an enriched context.
/// Every other operation goes to the wrapped stream unchanged.
struct ContextStream {
    ctx: RequestContext,
    inner: Box<dyn ServerStream>,
}

#[async_trait]
impl ServerStream for ContextStream {
    fn context(&self) -> &RequestContext {
        &self.ctx
    }

    async fn recv(&mut self) -> Result<Option<Box<dyn CallMessage>>, Status> {
        self.inner.recv().await
    }

    async fn send(&mut self, message: AnyMessage) -> Result<(), Status> {
        self.inner.send(message).await
    }

    fn set_header(&mut self, metadata: HeaderMap) -> Result<(), Status> {
        self.inner.set_header(metadata)
    }
}

type StreamEndpoint =
    Box<dyn FnOnce(Box<dyn ServerStream>) -> BoxFuture<'static, Result<(), Status>> + Send>;

/// A streaming call on its way to the business handler.
pub struct StreamCall {
    pub method: MethodInfo,
    stream: Box<dyn ServerStream>,
    endpoint: StreamEndpoint,
}

impl StreamCall {
    pub fn new<F>(method: MethodInfo, stream: Box<dyn ServerStream>, endpoint: F) -> Self
    where
        F: FnOnce(Box<dyn ServerStream>) -> BoxFuture<'static, Result<(), Status>> + Send + 'static,
    {
        Self {
            method,
            stream,
            endpoint: Box::new(endpoint),
        }
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        self.stream.context()
    }

    /// Wraps the stream so that it reports `ctx` as its context.
    #[must_use]
    pub fn with_context(mut self, ctx: RequestContext) -> Self {
        self.stream = Box::new(ContextStream {
            ctx,
            inner: self.stream,
        });
        self
    }

    /// Runs the business handler over the (possibly wrapped) stream.
    pub fn dispatch(self) -> BoxFuture<'static, Result<(), Status>> {
        (self.endpoint)(self.stream)
    }
}

impl fmt::Debug for StreamCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCall")
            .field("method", &self.method.full_method)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
