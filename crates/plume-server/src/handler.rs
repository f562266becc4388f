//! Handler traits and the adapters for the four call shapes.
//!
//! The listener contract is the low-level surface: a [`ServerCallHandler`]
//! receives the call and returns the [`ServerCallListener`] that will see its
//! inbound events. [`unary`], [`server_streaming`], [`client_streaming`] and
//! [`bidi_streaming`] build handlers from async functions on top of it.

use crate::call::ServerCall;
use crate::context::RequestContext;
use crate::streaming::{RequestSender, RequestStream, ResponseSink};
use plume_core::{CallError, Code, Codec, Metadata, ServiceError, Status};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;

/// Inbound events of one call, delivered one at a time in arrival order.
///
/// Every callback runs with the call's [`RequestContext`] current.
pub trait ServerCallListener<Req>: Send + 'static {
    fn on_message(&mut self, message: Req) {
        let _ = message;
    }

    /// The peer will send no more messages
    fn on_half_close(&mut self) {}

    /// The peer cancelled; delivered at most once
    fn on_cancel(&mut self) {}

    /// The call reached CLOSED; delivered exactly once, last
    fn on_complete(&mut self, status: &Status) {
        let _ = status;
    }

    /// Outbound backpressure was relieved
    fn on_ready(&mut self) {}
}

/// Starts calls of one method
pub trait ServerCallHandler<C: Codec>: Send + Sync + 'static {
    fn start_call(&self, call: ServerCall<C>) -> Box<dyn ServerCallListener<C::Request>>;
}

/// Write a single response and close with OK
fn respond<C: Codec>(call: &ServerCall<C>, response: &C::Response) {
    match call.send_message_with_headers(response) {
        Ok(()) => {
            call.close(Status::ok(), Metadata::new());
        }
        // The call already closed itself with RESOURCE_EXHAUSTED
        Err(CallError::MessageTooLarge { .. }) => {}
        Err(err) => {
            call.close_with_error(err.into());
        }
    }
}

fn finish<C: Codec>(call: &ServerCall<C>, result: Result<(), ServiceError>) {
    match result {
        Ok(()) => {
            call.close(Status::ok(), Metadata::new());
        }
        Err(err) => {
            call.close_with_error(err);
        }
    }
}

fn cancelled() -> Status {
    Status::cancelled("call cancelled by peer")
}

/// Handler for calls with one request and one response
pub fn unary<F>(handler: F) -> UnaryMethod<F> {
    UnaryMethod {
        handler: Arc::new(handler),
    }
}

/// Handler for calls with one request and a stream of responses
pub fn server_streaming<F>(handler: F) -> ServerStreamingMethod<F> {
    ServerStreamingMethod {
        handler: Arc::new(handler),
    }
}

/// Handler for calls with a stream of requests and one response
pub fn client_streaming<F>(handler: F) -> ClientStreamingMethod<F> {
    ClientStreamingMethod {
        handler: Arc::new(handler),
    }
}

/// Handler for calls with streams in both directions
pub fn bidi_streaming<F>(handler: F) -> BidiStreamingMethod<F> {
    BidiStreamingMethod {
        handler: Arc::new(handler),
    }
}

pub struct UnaryMethod<F> {
    handler: Arc<F>,
}

impl<C, F, Fut> ServerCallHandler<C> for UnaryMethod<F>
where
    C: Codec,
    F: Fn(RequestContext, C::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Response, ServiceError>> + Send + 'static,
{
    fn start_call(&self, call: ServerCall<C>) -> Box<dyn ServerCallListener<C::Request>> {
        call.request(1);
        Box::new(SingleRequest {
            call,
            request: None,
            started: false,
            invoke: {
                let handler = Arc::clone(&self.handler);
                move |call: ServerCall<C>, request: C::Request| {
                    let response = handler(call.context().clone(), request);
                    let writer = call.clone();
                    call.spawn(async move {
                        match response.await {
                            Ok(response) => respond(&writer, &response),
                            Err(err) => {
                                writer.close_with_error(err);
                            }
                        }
                    });
                }
            },
        })
    }
}

pub struct ServerStreamingMethod<F> {
    handler: Arc<F>,
}

impl<C, F, Fut> ServerCallHandler<C> for ServerStreamingMethod<F>
where
    C: Codec,
    F: Fn(RequestContext, C::Request, ResponseSink<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    fn start_call(&self, call: ServerCall<C>) -> Box<dyn ServerCallListener<C::Request>> {
        call.request(1);
        let ready = Arc::new(Notify::new());
        let sink_ready = Arc::clone(&ready);
        Box::new(Ready {
            ready,
            inner: SingleRequest {
                call,
                request: None,
                started: false,
                invoke: {
                    let handler = Arc::clone(&self.handler);
                    move |call: ServerCall<C>, request: C::Request| {
                        let sink = ResponseSink::new(call.clone(), Arc::clone(&sink_ready));
                        let done = handler(call.context().clone(), request, sink);
                        let writer = call.clone();
                        call.spawn(async move { finish(&writer, done.await) });
                    }
                },
            },
        })
    }
}

pub struct ClientStreamingMethod<F> {
    handler: Arc<F>,
}

impl<C, F, Fut> ServerCallHandler<C> for ClientStreamingMethod<F>
where
    C: Codec,
    F: Fn(RequestContext, RequestStream<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Response, ServiceError>> + Send + 'static,
{
    fn start_call(&self, call: ServerCall<C>) -> Box<dyn ServerCallListener<C::Request>> {
        let (tx, requests) = RequestStream::channel(call.clone());
        let response = (self.handler)(call.context().clone(), requests);
        let writer = call.clone();
        call.spawn(async move {
            match response.await {
                Ok(response) => respond(&writer, &response),
                Err(err) => {
                    writer.close_with_error(err);
                }
            }
        });
        call.request(call.config().initial_request);
        Box::new(Streaming { tx: Some(tx) })
    }
}

pub struct BidiStreamingMethod<F> {
    handler: Arc<F>,
}

impl<C, F, Fut> ServerCallHandler<C> for BidiStreamingMethod<F>
where
    C: Codec,
    F: Fn(RequestContext, RequestStream<C>, ResponseSink<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    fn start_call(&self, call: ServerCall<C>) -> Box<dyn ServerCallListener<C::Request>> {
        let ready = Arc::new(Notify::new());
        let (tx, requests) = RequestStream::channel(call.clone());
        let sink = ResponseSink::new(call.clone(), Arc::clone(&ready));
        let done = (self.handler)(call.context().clone(), requests, sink);
        let writer = call.clone();
        call.spawn(async move { finish(&writer, done.await) });
        call.request(call.config().initial_request);
        Box::new(Ready {
            ready,
            inner: Streaming { tx: Some(tx) },
        })
    }
}

/// Buffers the single request and invokes the handler on half-close
struct SingleRequest<C: Codec, I> {
    call: ServerCall<C>,
    request: Option<C::Request>,
    started: bool,
    invoke: I,
}

impl<C, I> ServerCallListener<C::Request> for SingleRequest<C, I>
where
    C: Codec,
    I: FnMut(ServerCall<C>, C::Request) + Send + 'static,
{
    fn on_message(&mut self, message: C::Request) {
        if self.request.is_some() {
            self.call.close(
                Status::internal("too many requests for a single-request call"),
                Metadata::new(),
            );
            return;
        }
        self.request = Some(message);
    }

    fn on_half_close(&mut self) {
        let Some(request) = self.request.take() else {
            self.call
                .close(Status::internal("half-closed without a request"), Metadata::new());
            return;
        };
        self.started = true;
        (self.invoke)(self.call.clone(), request);
    }

    fn on_cancel(&mut self) {
        // Once started, the handler closes the call when it finishes.
        if !self.started {
            self.call.close(cancelled(), Metadata::new());
        }
    }
}

/// Feeds inbound events to a [`RequestStream`]
struct Streaming<Req> {
    tx: Option<RequestSender<Req>>,
}

impl<Req: Send + 'static> ServerCallListener<Req> for Streaming<Req> {
    fn on_message(&mut self, message: Req) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(message));
        }
    }

    fn on_half_close(&mut self) {
        self.tx = None;
    }

    fn on_cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(cancelled()));
        }
    }

    fn on_complete(&mut self, status: &Status) {
        // A failed call must not look like a clean half-close to the handler.
        if let Some(tx) = self.tx.take() {
            if status.code() != Code::Ok {
                let _ = tx.send(Err(status.clone()));
            }
        }
    }
}

/// Wakes a [`ResponseSink`] waiting for readiness, then forwards
struct Ready<L> {
    ready: Arc<Notify>,
    inner: L,
}

impl<Req, L: ServerCallListener<Req>> ServerCallListener<Req> for Ready<L> {
    fn on_message(&mut self, message: Req) {
        self.inner.on_message(message);
    }

    fn on_half_close(&mut self) {
        self.inner.on_half_close();
    }

    fn on_cancel(&mut self) {
        self.ready.notify_one();
        self.inner.on_cancel();
    }

    fn on_complete(&mut self, status: &Status) {
        self.ready.notify_one();
        self.inner.on_complete(status);
    }

    fn on_ready(&mut self) {
        self.ready.notify_one();
        self.inner.on_ready();
    }
}
