//! Request-scoped context visible to handler code.

use http::Extensions;
use plume_core::{ContextBridge, Metadata};
use std::sync::{Arc, Mutex};

/// What handler code can learn about the call it is serving.
///
/// Every listener callback and every poll of a handler future runs with the
/// call's context current, so [`RequestContext::current`] works from any
/// depth of handler code without threading the value through.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

struct Inner {
    call_id: u64,
    method: String,
    headers: Metadata,
    attributes: Mutex<Extensions>,
}

impl RequestContext {
    pub fn new(call_id: u64, method: impl Into<String>, headers: Metadata) -> Self {
        Self {
            inner: Arc::new(Inner {
                call_id,
                method: method.into(),
                headers,
                attributes: Mutex::new(Extensions::new()),
            }),
        }
    }

    /// The context current on this thread, if a call is being served
    pub fn current() -> Option<Self> {
        ContextBridge::<Self>::new().current()
    }

    pub fn call_id(&self) -> u64 {
        self.inner.call_id
    }

    /// Full method path, e.g. `echo.v1.EchoService/Echo`
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Request headers as received
    pub fn headers(&self) -> &Metadata {
        &self.inner.headers
    }

    /// Attach a typed attribute for the rest of the call
    pub fn set_attr<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.inner
            .attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(value)
    }

    pub fn attr<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner
            .attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get::<T>()
            .cloned()
    }

    /// Whether two handles refer to the same call
    pub fn same_call(&self, other: &RequestContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("call_id", &self.inner.call_id)
            .field("method", &self.inner.method)
            .finish()
    }
}
