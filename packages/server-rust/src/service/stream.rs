//! Bridges tonic's streaming types to [`ServerStream`].

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use parking_lot::Mutex;
use rpcgate_core::RequestContext;
use tokio::sync::{mpsc, oneshot};
use tonic::metadata::MetadataMap;
use tonic::{Status, Streaming};

use super::call::{AnyMessage, AsAny, CallMessage, ServerStream};

/// Buffered outbound messages per streaming call.
pub(crate) const STREAM_BUFFER: usize = 16;

type HeaderSender = oneshot::Sender<Result<HeaderMap, Status>>;

/// One-shot delivery of the response headers (or an early failure) to the
/// tonic method that is waiting to return its `Response`.
#[derive(Clone)]
pub(crate) struct HeaderSlot(Arc<Mutex<Option<HeaderSender>>>);

impl HeaderSlot {
    pub(crate) fn new(tx: HeaderSender) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    /// Sends `result` unless headers already went out. Returns whether this
    /// call delivered it.
    pub(crate) fn deliver(&self, result: Result<HeaderMap, Status>) -> bool {
        match self.0.lock().take() {
            Some(tx) => {
                // receiver gone means the call was abandoned
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

pub(crate) enum Incoming<In> {
    Single(Option<In>),
    Streaming(Streaming<In>),
}

/// Server side of a tonic streaming call, as seen by the chain.
pub(crate) struct TonicServerStream<In, Out> {
    ctx: RequestContext,
    incoming: Incoming<In>,
    outgoing: Option<mpsc::Sender<Result<Out, Status>>>,
    header: HeaderSlot,
}

impl<In, Out> TonicServerStream<In, Out> {
    pub(crate) fn new(
        ctx: RequestContext,
        incoming: Incoming<In>,
        outgoing: Option<mpsc::Sender<Result<Out, Status>>>,
        header: HeaderSlot,
    ) -> Self {
        Self {
            ctx,
            incoming,
            outgoing,
            header,
        }
    }
}

#[async_trait]
impl<In, Out> ServerStream for TonicServerStream<In, Out>
where
    In: CallMessage,
    Out: Send + 'static,
{
    fn context(&self) -> &RequestContext {
        &self.ctx
    }

    async fn recv(&mut self) -> Result<Option<Box<dyn CallMessage>>, Status> {
        let next = match &mut self.incoming {
            Incoming::Single(message) => message.take(),
            Incoming::Streaming(stream) => stream.message().await?,
        };
        Ok(next.map(|m| Box::new(m) as Box<dyn CallMessage>))
    }

    async fn send(&mut self, message: AnyMessage) -> Result<(), Status> {
        let Some(outgoing) = &self.outgoing else {
            return Err(Status::internal("call does not stream responses"));
        };
        let message = message
            .downcast::<Out>()
            .map_err(|_| Status::internal("unexpected response message type"))?;
        self.header.deliver(Ok(HeaderMap::new()));
        outgoing
            .send(Ok(*message))
            .await
            .map_err(|_| Status::cancelled("client went away"))
    }

    fn set_header(&mut self, metadata: HeaderMap) -> Result<(), Status> {
        if self.header.deliver(Ok(metadata)) {
            Ok(())
        } else {
            Err(Status::failed_precondition("response headers already sent"))
        }
    }
}

/// Typed view of a streaming call handed to business handlers.
///
/// The context is the one enriched by the interceptor chain.
pub struct RpcStream<In, Out> {
    inner: Box<dyn ServerStream>,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out> RpcStream<In, Out>
where
    In: CallMessage,
    Out: Send + 'static,
{
    pub(crate) fn new(inner: Box<dyn ServerStream>) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        self.inner.context()
    }

    /// Next client message, `None` once the client half-closes.
    ///
    /// # Errors
    ///
    /// Returns the transport's status when receiving fails.
    pub async fn message(&mut self) -> Result<Option<In>, Status> {
        match self.inner.recv().await? {
            Some(message) => message
                .into_any()
                .downcast::<In>()
                .map(|m| Some(*m))
                .map_err(|_| Status::internal("unexpected request message type")),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns `Cancelled` when the client is gone.
    pub async fn send(&mut self, message: Out) -> Result<(), Status> {
        self.inner.send(Box::new(message)).await
    }

    /// Sets response header metadata; only possible before the first send.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when headers were already sent.
    pub fn set_header(&mut self, metadata: MetadataMap) -> Result<(), Status> {
        self.inner.set_header(metadata.into_headers())
    }
}
