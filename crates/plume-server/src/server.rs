//! Plume call service: the route table plus everything calls share

use crate::call::CallParts;
use crate::config::CallConfig;
use crate::context::RequestContext;
use crate::handler::{
    BidiStreamingMethod, ClientStreamingMethod, ServerCallHandler, ServerStreamingMethod,
    UnaryMethod,
};
use crate::observability::CallMetrics;
use crate::resolver::{StatusResolver, StatusResolverBuilder};
use crate::router::RpcRouter;
use crate::transport::{ServerTransport, TransportListener};
use bytes::Bytes;
use plume_core::{
    Codec, ConfigError, DirectExecutor, ErrorClass, Executor, Metadata, ResolvedStatus,
    ServiceError, Status,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves calls for a fixed set of methods
pub struct CallService {
    router: RpcRouter,
    resolver: Arc<StatusResolver>,
    config: Arc<CallConfig>,
    executor: Arc<dyn Executor>,
    metrics: CallMetrics,
    next_call_id: AtomicU64,
}

impl CallService {
    /// Create a builder for configuring the service
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Accept a new call from the transport.
    ///
    /// The returned listener receives the call's inbound events. An unknown
    /// path is closed right away with UNIMPLEMENTED.
    pub fn start_call(
        &self,
        path: &str,
        headers: Metadata,
        transport: Arc<dyn ServerTransport>,
    ) -> Arc<dyn TransportListener> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);

        let Some(entry) = self.router.get(path) else {
            warn!(path, call_id, "no handler registered");
            transport.write_trailers(
                &Status::unimplemented(format!("Method not found: {}", path)),
                Metadata::new(),
            );
            return Arc::new(Unrouted);
        };

        let method = path.strip_prefix('/').unwrap_or(path);
        debug!(method, call_id, "dispatching call");
        entry.start(CallParts {
            context: RequestContext::new(call_id, method, headers),
            transport,
            resolver: Arc::clone(&self.resolver),
            config: Arc::clone(&self.config),
            executor: Arc::clone(&self.executor),
            metrics: self.metrics.clone(),
        })
    }

    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    pub fn resolver(&self) -> &StatusResolver {
        &self.resolver
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn routes(&self) -> &RpcRouter {
        &self.router
    }
}

/// Transport listener for a call that was rejected before it started
struct Unrouted;

impl TransportListener for Unrouted {
    fn on_message(&self, _message: Bytes) {}

    fn on_half_close(&self) {}

    fn on_cancel(&self) {}

    fn on_ready(&self) {}
}

/// Builder for creating a call service.
///
/// Route and exception-mapping errors surface when the offending method is
/// called, not at the first request.
pub struct ServiceBuilder {
    router: RpcRouter,
    resolver: StatusResolverBuilder,
    config: CallConfig,
    executor: Option<Arc<dyn Executor>>,
}

impl ServiceBuilder {
    /// Create a new service builder
    pub fn new() -> Self {
        Self {
            router: RpcRouter::new(),
            resolver: StatusResolverBuilder::new(),
            config: CallConfig::default(),
            executor: None,
        }
    }

    /// Register a handler for an RPC method
    /// Path format: "{package}.{Service}/{Method}"
    pub fn register<C, H>(mut self, path: &str, codec: C, handler: H) -> Result<Self, ConfigError>
    where
        C: Codec,
        H: ServerCallHandler<C>,
    {
        self.router.register(path, codec, handler)?;
        Ok(self)
    }

    /// Register a unary handler (see [`unary`](crate::handler::unary))
    pub fn unary<C, F>(self, path: &str, codec: C, handler: F) -> Result<Self, ConfigError>
    where
        C: Codec,
        UnaryMethod<F>: ServerCallHandler<C>,
    {
        self.register(path, codec, crate::handler::unary(handler))
    }

    pub fn server_streaming<C, F>(self, path: &str, codec: C, handler: F) -> Result<Self, ConfigError>
    where
        C: Codec,
        ServerStreamingMethod<F>: ServerCallHandler<C>,
    {
        self.register(path, codec, crate::handler::server_streaming(handler))
    }

    pub fn client_streaming<C, F>(self, path: &str, codec: C, handler: F) -> Result<Self, ConfigError>
    where
        C: Codec,
        ClientStreamingMethod<F>: ServerCallHandler<C>,
    {
        self.register(path, codec, crate::handler::client_streaming(handler))
    }

    pub fn bidi_streaming<C, F>(self, path: &str, codec: C, handler: F) -> Result<Self, ConfigError>
    where
        C: Codec,
        BidiStreamingMethod<F>: ServerCallHandler<C>,
    {
        self.register(path, codec, crate::handler::bidi_streaming(handler))
    }

    /// Map failures of `class` to `status`
    pub fn add_exception_mapping(
        mut self,
        class: &'static ErrorClass,
        status: Status,
    ) -> Result<Self, ConfigError> {
        self.resolver = self.resolver.add_exception_mapping(class, status)?;
        Ok(self)
    }

    /// Map failures of `class` to `status` with trailers produced from the failure
    pub fn add_exception_mapping_with_metadata<F>(
        mut self,
        class: &'static ErrorClass,
        status: Status,
        metadata: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&ServiceError) -> Metadata + Send + Sync + 'static,
    {
        self.resolver = self
            .resolver
            .add_exception_mapping_with_metadata(class, status, metadata)?;
        Ok(self)
    }

    /// Resolve every failure through `f`; exclusive with class mappings
    pub fn exception_mapping<F>(mut self, f: F) -> Result<Self, ConfigError>
    where
        F: Fn(&ServiceError) -> Option<Status> + Send + Sync + 'static,
    {
        self.resolver = self.resolver.exception_mapping(f)?;
        Ok(self)
    }

    pub fn exception_mapping_with_metadata<F>(mut self, f: F) -> Result<Self, ConfigError>
    where
        F: Fn(&ServiceError) -> Option<ResolvedStatus> + Send + Sync + 'static,
    {
        self.resolver = self.resolver.exception_mapping_with_metadata(f)?;
        Ok(self)
    }

    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Executor for listener callbacks and handler futures (default: the
    /// thread that delivers each event)
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the service
    pub fn build(self) -> Result<CallService, ConfigError> {
        self.config.validate()?;
        let resolver = self.resolver.verbose(self.config.verbose_responses).build();
        Ok(CallService {
            router: self.router,
            resolver: Arc::new(resolver),
            config: Arc::new(self.config),
            executor: self.executor.unwrap_or_else(|| Arc::new(DirectExecutor)),
            metrics: CallMetrics::new(),
            next_call_id: AtomicU64::new(1),
        })
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
