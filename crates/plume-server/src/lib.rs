//! Server-side call adapter for the Plume RPC framework.
//!
//! This crate provides the per-call machinery between an HTTP/2 transport
//! and handler code:
//! - The call state machine and the call adapter
//! - Listener and handler traits, with unary and streaming adapters
//! - Failure-to-status resolution
//! - Route table and service builder
//! - Per-method call metrics

pub mod call;
pub mod call_state;
pub mod config;
pub mod context;
pub mod handler;
pub mod observability;
pub mod resolver;
pub mod router;
pub mod server;
pub mod streaming;
pub mod transport;

pub use call::ServerCall;
pub use call_state::{CallPhase, CallState};
pub use config::CallConfig;
pub use context::RequestContext;
pub use handler::{
    bidi_streaming, client_streaming, server_streaming, unary, ServerCallHandler,
    ServerCallListener,
};
pub use observability::{CallMetrics, MethodStats};
pub use resolver::{ExceptionMapping, ExceptionMappings, StatusResolver, StatusResolverBuilder};
pub use router::{parse_rpc_path, RpcRouter};
pub use server::{CallService, ServiceBuilder};
pub use streaming::{RequestStream, ResponseSink};
pub use transport::{ServerTransport, TransportListener};
