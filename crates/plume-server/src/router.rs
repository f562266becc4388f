//! Route table for RPC methods
//!
//! Routes match the pattern: {package}.{Service}/{Method}

use crate::call::{CallParts, ServerCall};
use crate::handler::ServerCallHandler;
use crate::transport::TransportListener;
use plume_core::{Codec, ConfigError};
use std::collections::HashMap;
use std::sync::Arc;

/// A registered method with its codec and handler types erased
pub(crate) trait MethodEntry: Send + Sync {
    fn start(&self, parts: CallParts) -> Arc<dyn TransportListener>;
}

struct Method<C, H> {
    codec: Arc<C>,
    handler: H,
}

impl<C, H> MethodEntry for Method<C, H>
where
    C: Codec,
    H: ServerCallHandler<C>,
{
    fn start(&self, parts: CallParts) -> Arc<dyn TransportListener> {
        let call = ServerCall::new(Arc::clone(&self.codec), parts);
        let listener = plume_core::ContextBridge::new()
            .propagate(call.context().clone(), || self.handler.start_call(call.clone()));
        call.install_listener(listener);
        call.transport_listener()
    }
}

/// RPC router, built once and read-only afterwards
#[derive(Default)]
pub struct RpcRouter {
    routes: HashMap<String, Arc<dyn MethodEntry>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a service method.
    /// Path format: "{package}.{Service}/{Method}"
    pub fn register<C, H>(&mut self, path: &str, codec: C, handler: H) -> Result<(), ConfigError>
    where
        C: Codec,
        H: ServerCallHandler<C>,
    {
        let (service, method) =
            parse_rpc_path(path).ok_or_else(|| ConfigError::InvalidRoute(path.to_string()))?;
        let key = format!("{}/{}", service, method);
        if self.routes.contains_key(&key) {
            return Err(ConfigError::DuplicateRoute(key));
        }
        self.routes.insert(
            key,
            Arc::new(Method {
                codec: Arc::new(codec),
                handler,
            }),
        );
        Ok(())
    }

    pub(crate) fn get(&self, path: &str) -> Option<&Arc<dyn MethodEntry>> {
        self.routes.get(path.strip_prefix('/').unwrap_or(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Parse an RPC path into (service, method)
/// Expected format: "{package}.{Service}/{Method}"
pub fn parse_rpc_path(path: &str) -> Option<(String, String)> {
    let path = path.strip_prefix('/').unwrap_or(path);

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 2 {
        return None;
    }

    let (service, method) = (parts[0], parts[1]);
    // The service name must be package-qualified
    let (package, name) = service.rsplit_once('.')?;
    if package.is_empty() || name.is_empty() || method.is_empty() {
        return None;
    }

    Some((service.to_string(), method.to_string()))
}
