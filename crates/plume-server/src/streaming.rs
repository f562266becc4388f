//! Streaming support for handler code
//!
//! [`RequestStream`] hands inbound messages to a handler and grants one more
//! credit per message consumed, so the peer can never run further ahead than
//! the configured initial window. [`ResponseSink`] writes responses, sending
//! empty headers before the first message if the handler sent none.

use crate::call::ServerCall;
use crate::call_state::CallPhase;
use plume_core::{CallError, Codec, Metadata, Status};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};
use tokio_stream::Stream;

pub(crate) type RequestSender<Req> = mpsc::UnboundedSender<Result<Req, Status>>;

/// Inbound messages of a streaming call.
///
/// Yields `Err` once if the peer cancels, then ends.
pub struct RequestStream<C: Codec> {
    rx: mpsc::UnboundedReceiver<Result<C::Request, Status>>,
    call: ServerCall<C>,
}

impl<C: Codec> RequestStream<C> {
    pub(crate) fn channel(call: ServerCall<C>) -> (RequestSender<C::Request>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, call })
    }

    /// Next message, or `None` once the peer half-closed
    pub async fn message(&mut self) -> Option<Result<C::Request, Status>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl<C: Codec> Unpin for RequestStream<C> {}

impl<C: Codec> Stream for RequestStream<C> {
    type Item = Result<C::Request, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(message))) => {
                self.call.request(1);
                Poll::Ready(Some(Ok(message)))
            }
            other => other,
        }
    }
}

/// Outbound side of a streaming call
pub struct ResponseSink<C: Codec> {
    call: ServerCall<C>,
    ready: Arc<Notify>,
}

impl<C: Codec> ResponseSink<C> {
    pub(crate) fn new(call: ServerCall<C>, ready: Arc<Notify>) -> Self {
        Self { call, ready }
    }

    /// Send headers explicitly; otherwise empty headers precede the first message
    pub fn send_headers(&self, headers: Metadata) -> Result<(), CallError> {
        self.call.send_headers(headers)
    }

    /// Write one message. Silently dropped after a peer cancel.
    pub fn send(&self, message: &C::Response) -> Result<(), CallError> {
        self.call.send_message_with_headers(message)
    }

    /// Wait until the transport can take more messages without buffering
    pub async fn ready(&self) {
        loop {
            if self.call.phase() == CallPhase::Closed
                || self.call.is_cancelled()
                || self.call.is_ready()
            {
                return;
            }
            self.ready.notified().await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.call.is_cancelled()
    }

    pub fn call(&self) -> &ServerCall<C> {
        &self.call
    }
}
