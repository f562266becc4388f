//! The server call adapter.
//!
//! A [`ServerCall`] sits between one RPC on the transport and the handler
//! serving it. Handler writes and transport events both go through the same
//! [`CallState`] lock, and every transport write happens while that lock is
//! held, so nothing can be written after the trailers.
//!
//! Listener callbacks are queued and drained one at a time on the service
//! executor, with the call's [`RequestContext`] current. A callback that
//! calls back into the call (to close it, say) never re-enters the listener;
//! the resulting event is delivered after the callback returns.

use crate::call_state::{CallPhase, CallState, Close, Inbound, Write};
use crate::config::CallConfig;
use crate::context::RequestContext;
use crate::handler::ServerCallListener;
use crate::observability::CallMetrics;
use crate::resolver::StatusResolver;
use crate::transport::{ServerTransport, TransportListener};
use bytes::Bytes;
use plume_core::{
    spawn_with_affinity, CallError, Code, Codec, ContextBridge, DispatchError, Executor, Metadata,
    ServiceError, Status,
};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Everything a call borrows from its service
pub(crate) struct CallParts {
    pub context: RequestContext,
    pub transport: Arc<dyn ServerTransport>,
    pub resolver: Arc<StatusResolver>,
    pub config: Arc<CallConfig>,
    pub executor: Arc<dyn Executor>,
    pub metrics: CallMetrics,
}

enum CallEvent<Req> {
    Message(Req),
    HalfClose,
    Cancel,
    Ready,
    Complete(Status),
}

struct EventQueue<Req> {
    listener: Option<Box<dyn ServerCallListener<Req>>>,
    pending: VecDeque<CallEvent<Req>>,
    /// A drain is scheduled or running
    draining: bool,
    installed: bool,
    /// `on_complete` has been delivered; later events are discarded
    finished: bool,
}

// `CallInner::dispatch`: whether `schedule_drain` is inside `Executor::execute`
const NOT_EXECUTING: u8 = 0;
const EXECUTING: u8 = 1;
const DROPPED_IN_EXECUTE: u8 = 2;

struct CallInner<C: Codec> {
    codec: Arc<C>,
    parts: CallParts,
    state: Mutex<CallState>,
    events: Mutex<EventQueue<C::Request>>,
    dispatch: AtomicU8,
}

/// A drain handed to the executor. Dropping it unrun closes the call.
struct DrainStep<C: Codec> {
    inner: Option<Arc<CallInner<C>>>,
}

impl<C: Codec> DrainStep<C> {
    fn run(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.drain();
        }
    }
}

impl<C: Codec> Drop for DrainStep<C> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        // Dropped inside `execute`: `schedule_drain` reports it once the
        // executor returns.
        if inner
            .dispatch
            .compare_exchange(EXECUTING, DROPPED_IN_EXECUTE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        inner.abandon_drain(DispatchError::Dropped);
    }
}

/// Handler-facing handle to one call. Clones share the call.
pub struct ServerCall<C: Codec> {
    inner: Arc<CallInner<C>>,
}

impl<C: Codec> Clone for ServerCall<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> ServerCall<C> {
    pub(crate) fn new(codec: Arc<C>, parts: CallParts) -> Self {
        let state = CallState::new(
            parts.config.max_inbound_message_size,
            parts.config.max_outbound_message_size,
        );
        parts.metrics.record_start(parts.context.method());
        debug!(method = parts.context.method(), call_id = parts.context.call_id(), "call started");

        Self {
            inner: Arc::new(CallInner {
                codec,
                parts,
                state: Mutex::new(state),
                events: Mutex::new(EventQueue {
                    listener: None,
                    pending: VecDeque::new(),
                    draining: false,
                    installed: false,
                    finished: false,
                }),
                dispatch: AtomicU8::new(NOT_EXECUTING),
            }),
        }
    }

    /// Start delivering events to `listener`, including any queued while the
    /// handler was starting.
    pub(crate) fn install_listener(&self, listener: Box<dyn ServerCallListener<C::Request>>) {
        let schedule = {
            let mut queue = self.inner.lock_events();
            queue.listener = Some(listener);
            queue.installed = true;
            if !queue.pending.is_empty() && !queue.draining {
                queue.draining = true;
                true
            } else {
                false
            }
        };
        if schedule {
            self.inner.schedule_drain();
        }
    }

    /// The transport-facing side of this call
    pub(crate) fn transport_listener(&self) -> Arc<dyn TransportListener> {
        Arc::new(self.clone())
    }

    /// Allow the peer to send `n` more messages
    pub fn request(&self, n: u32) {
        let granted = self.inner.lock_state().request(n);
        // Outside the lock: the transport may deliver a buffered message
        // from inside `request_more_messages`.
        if granted {
            debug!(method = self.method(), credits = n, "requested messages");
            self.inner.parts.transport.request_more_messages(n);
        }
    }

    /// Write response headers; at most once, before any message
    pub fn send_headers(&self, headers: Metadata) -> Result<(), CallError> {
        let mut state = self.inner.lock_state();
        if state.send_headers()? == Write::Proceed {
            self.inner.parts.transport.write_headers(headers);
        }
        Ok(())
    }

    /// Write one response message.
    ///
    /// After a peer cancel this is a silent no-op. A message over the
    /// outbound limit closes the call with RESOURCE_EXHAUSTED.
    pub fn send_message(&self, message: &C::Response) -> Result<(), CallError> {
        let bytes = self.inner.codec.encode(message)?;
        let state = self.inner.lock_state();
        self.inner.write_message(state, bytes)
    }

    /// Send empty headers if none were sent yet, then the message
    pub(crate) fn send_message_with_headers(&self, message: &C::Response) -> Result<(), CallError> {
        let bytes = self.inner.codec.encode(message)?;
        let mut state = self.inner.lock_state();
        if !state.headers_sent() && state.send_headers()? == Write::Proceed {
            self.inner.parts.transport.write_headers(Metadata::new());
        }
        self.inner.write_message(state, bytes)
    }

    /// Close the call. Only the first close has any effect.
    ///
    /// Returns true if this invocation closed the call.
    pub fn close(&self, status: Status, trailers: Metadata) -> bool {
        let state = self.inner.lock_state();
        self.inner.close_locked(state, status, trailers)
    }

    /// Close the call with the status the service resolver picks for `error`
    pub fn close_with_error(&self, error: ServiceError) -> bool {
        let (status, trailers) = self.inner.parts.resolver.resolve(error).into_parts();
        self.close(status, trailers)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock_state().is_cancelled()
    }

    /// Whether the transport can take more messages without buffering
    pub fn is_ready(&self) -> bool {
        let closed = self.inner.lock_state().is_closed();
        !closed && self.inner.parts.transport.is_ready()
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.lock_state().phase()
    }

    pub fn context(&self) -> &RequestContext {
        &self.inner.parts.context
    }

    pub fn method(&self) -> &str {
        self.inner.parts.context.method()
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.parts.config
    }

    /// Drive `future` on the service executor with this call's context current.
    ///
    /// If the executor rejects a step the call closes with INTERNAL; a panic
    /// closes it with UNKNOWN.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let call = self.clone();
        let future = ContextBridge::new().with_context(self.context().clone(), future);
        spawn_with_affinity(self.inner.parts.executor.clone(), future, move |result| {
            if let Err(err) = result {
                call.inner.dispatch_failed(err);
            }
        });
    }
}

impl<C: Codec> std::fmt::Debug for ServerCall<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("method", &self.method())
            .field("call_id", &self.context().call_id())
            .finish()
    }
}

impl<C: Codec> CallInner<C> {
    fn method(&self) -> &str {
        self.parts.context.method()
    }

    fn lock_state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_events(&self) -> MutexGuard<'_, EventQueue<C::Request>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_message(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, CallState>,
        bytes: Bytes,
    ) -> Result<(), CallError> {
        match state.send_message(bytes.len()) {
            Ok(Write::Proceed) => {
                self.parts.transport.write_message(bytes);
                Ok(())
            }
            Ok(Write::Skip) => Ok(()),
            Err(err @ CallError::MessageTooLarge { .. }) => {
                warn!(method = self.method(), error = %err, "outbound message over limit");
                self.close_locked(state, Status::resource_exhausted(err.to_string()), Metadata::new());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn close_locked(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, CallState>,
        status: Status,
        trailers: Metadata,
    ) -> bool {
        let Some(action) = state.close() else {
            debug!(method = self.method(), "close ignored, call already closed");
            return false;
        };
        if action == Close::WriteTrailers {
            self.parts.transport.write_trailers(&status, trailers);
        }
        self.parts.metrics.record_close(self.method(), status.code());
        debug!(method = self.method(), code = %status.code(), "call closed");

        let schedule = self.push(CallEvent::Complete(status));
        drop(state);
        if schedule {
            self.schedule_drain();
        }
        true
    }

    fn close_violation(self: &Arc<Self>, state: MutexGuard<'_, CallState>, status: Status) {
        warn!(method = self.method(), code = %status.code(), description = ?status.description(), "protocol violation");
        self.parts.metrics.record_violation(self.method());
        self.close_locked(state, status, Metadata::new());
    }

    fn dispatch_failed(self: &Arc<Self>, err: DispatchError) {
        warn!(method = self.method(), error = %err, "handler dispatch failed");
        let status = match err {
            DispatchError::Panicked => Status::new(Code::Unknown),
            other => Status::internal(other.to_string()),
        };
        let state = self.lock_state();
        self.close_locked(state, status, Metadata::new());
    }

    /// Queue an event. Returns true if the caller must schedule a drain.
    fn push(&self, event: CallEvent<C::Request>) -> bool {
        let mut queue = self.lock_events();
        if queue.finished {
            return false;
        }
        queue.pending.push_back(event);
        if queue.draining || !queue.installed {
            return false;
        }
        queue.draining = true;
        true
    }

    /// Push under the state lock, then schedule once it is released
    fn push_locked(self: &Arc<Self>, state: MutexGuard<'_, CallState>, event: CallEvent<C::Request>) {
        let schedule = self.push(event);
        drop(state);
        if schedule {
            self.schedule_drain();
        }
    }

    fn schedule_drain(self: &Arc<Self>) {
        let step = DrainStep {
            inner: Some(Arc::clone(self)),
        };
        self.dispatch.store(EXECUTING, Ordering::Release);
        let result = self.parts.executor.execute(Box::new(move || step.run()));
        let dropped = self.dispatch.swap(NOT_EXECUTING, Ordering::AcqRel) == DROPPED_IN_EXECUTE;
        match result {
            Err(err) => self.abandon_drain(err),
            Ok(()) if dropped => self.abandon_drain(DispatchError::Dropped),
            Ok(()) => {}
        }
    }

    /// The scheduled drain will never run. Close the call, or if it is already
    /// closed, discard the queue and release the listener.
    fn abandon_drain(self: &Arc<Self>, err: DispatchError) {
        warn!(
            method = self.method(),
            executor = self.parts.executor.name(),
            error = %err,
            "listener dispatch failed"
        );
        self.lock_events().draining = false;
        let state = self.lock_state();
        if self.close_locked(state, Status::internal(err.to_string()), Metadata::new()) {
            return;
        }
        let listener = {
            let mut queue = self.lock_events();
            queue.finished = true;
            queue.pending.clear();
            queue.listener.take()
        };
        drop(listener);
    }

    fn drain(self: Arc<Self>) {
        let bridge = ContextBridge::<RequestContext>::new();
        loop {
            let (event, listener) = {
                let mut queue = self.lock_events();
                match queue.pending.pop_front() {
                    Some(event) => (event, queue.listener.take()),
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            let Some(mut listener) = listener else {
                continue;
            };

            let complete = matches!(event, CallEvent::Complete(_));
            let outcome = bridge.propagate(self.parts.context.clone(), || {
                catch_unwind(AssertUnwindSafe(|| deliver(listener.as_mut(), event)))
            });

            if complete {
                {
                    let mut queue = self.lock_events();
                    queue.finished = true;
                    queue.pending.clear();
                }
                drop(listener);
            } else {
                self.lock_events().listener = Some(listener);
            }

            if outcome.is_err() {
                warn!(method = self.method(), "listener panicked");
                let state = self.lock_state();
                self.close_locked(state, Status::new(Code::Unknown), Metadata::new());
            }
        }
    }
}

fn deliver<Req: 'static>(listener: &mut dyn ServerCallListener<Req>, event: CallEvent<Req>) {
    match event {
        CallEvent::Message(message) => listener.on_message(message),
        CallEvent::HalfClose => listener.on_half_close(),
        CallEvent::Cancel => listener.on_cancel(),
        CallEvent::Ready => listener.on_ready(),
        CallEvent::Complete(status) => listener.on_complete(&status),
    }
}

impl<C: Codec> TransportListener for ServerCall<C> {
    fn on_message(&self, message: Bytes) {
        let this = &self.inner;
        let mut state = this.lock_state();
        match state.on_message(message.len()) {
            Inbound::Ignore => {}
            Inbound::Violation(status) => this.close_violation(state, status),
            Inbound::Deliver => match this.codec.decode(message) {
                Ok(request) => this.push_locked(state, CallEvent::Message(request)),
                Err(err) => {
                    warn!(method = this.method(), error = %err, "undecodable request");
                    this.close_locked(state, Status::internal(err.to_string()), Metadata::new());
                }
            },
        }
    }

    fn on_half_close(&self) {
        let this = &self.inner;
        let mut state = this.lock_state();
        if state.on_half_close() {
            debug!(method = this.method(), "peer half-closed");
            this.push_locked(state, CallEvent::HalfClose);
        }
    }

    fn on_cancel(&self) {
        let this = &self.inner;
        let mut state = this.lock_state();
        if state.on_cancel() {
            debug!(method = this.method(), "peer cancelled");
            this.parts.metrics.record_cancel(this.method());
            this.push_locked(state, CallEvent::Cancel);
        }
    }

    fn on_ready(&self) {
        let this = &self.inner;
        let state = this.lock_state();
        if !state.is_closed() {
            this.push_locked(state, CallEvent::Ready);
        }
    }
}
