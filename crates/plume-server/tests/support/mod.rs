//! Shared fixtures: a transport that records every write and a handler whose
//! listener records every callback.

#![allow(dead_code)]

use bytes::Bytes;
use plume_core::{BytesCodec, Code, Metadata, Status};
use plume_server::{
    RequestContext, ServerCall, ServerCallHandler, ServerCallListener, ServerTransport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const ECHO: &str = "echo.v1.EchoService/Echo";

#[derive(Debug, Clone)]
pub enum Written {
    Headers(Metadata),
    Message(Bytes),
    Trailers {
        code: Code,
        description: Option<String>,
        trailers: Metadata,
    },
    Request(u32),
}

/// Records transport writes in order
pub struct RecordingTransport {
    writes: Mutex<Vec<Written>>,
    ready: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
        })
    }

    pub fn writes(&self) -> Vec<Written> {
        self.writes.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.writes()
            .into_iter()
            .filter_map(|w| match w {
                Written::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn trailer_count(&self) -> usize {
        self.writes()
            .iter()
            .filter(|w| matches!(w, Written::Trailers { .. }))
            .count()
    }

    /// Code and description of the first trailers written
    pub fn status(&self) -> Option<(Code, Option<String>)> {
        self.writes().into_iter().find_map(|w| match w {
            Written::Trailers {
                code, description, ..
            } => Some((code, description)),
            _ => None,
        })
    }

    pub fn code(&self) -> Option<Code> {
        self.status().map(|(code, _)| code)
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.writes().into_iter().find_map(|w| match w {
            Written::Trailers { trailers, .. } => Some(trailers),
            _ => None,
        })
    }

    pub fn requested(&self) -> u32 {
        self.writes()
            .iter()
            .map(|w| match w {
                Written::Request(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn record(&self, written: Written) {
        self.writes.lock().unwrap().push(written);
    }
}

impl ServerTransport for RecordingTransport {
    fn write_headers(&self, headers: Metadata) {
        self.record(Written::Headers(headers));
    }

    fn write_message(&self, message: Bytes) {
        self.record(Written::Message(message));
    }

    fn write_trailers(&self, status: &Status, trailers: Metadata) {
        self.record(Written::Trailers {
            code: status.code(),
            description: status.description().map(str::to_owned),
            trailers,
        });
    }

    fn request_more_messages(&self, n: u32) {
        self.record(Written::Request(n));
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Ordered log of listener callbacks
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

type Hook = Arc<dyn Fn(&ServerCall<BytesCodec>, &Bytes) + Send + Sync>;

/// Raw listener-level handler that logs every callback
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub log: EventLog,
    pub initial_request: u32,
    calls: Arc<Mutex<Vec<ServerCall<BytesCodec>>>>,
    on_message: Option<Hook>,
}

impl RecordingHandler {
    pub fn new(initial_request: u32) -> Self {
        Self {
            initial_request,
            ..Self::default()
        }
    }

    /// Run `hook` inside every `on_message` callback
    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServerCall<BytesCodec>, &Bytes) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(hook));
        self
    }

    /// The most recently started call
    pub fn call(&self) -> ServerCall<BytesCodec> {
        self.calls
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no call started")
    }
}

impl ServerCallHandler<BytesCodec> for RecordingHandler {
    fn start_call(&self, call: ServerCall<BytesCodec>) -> Box<dyn ServerCallListener<Bytes>> {
        if self.initial_request > 0 {
            call.request(self.initial_request);
        }
        self.calls.lock().unwrap().push(call.clone());
        Box::new(RecordingListener {
            log: self.log.clone(),
            call,
            on_message: self.on_message.clone(),
        })
    }
}

struct RecordingListener {
    log: EventLog,
    call: ServerCall<BytesCodec>,
    on_message: Option<Hook>,
}

impl ServerCallListener<Bytes> for RecordingListener {
    fn on_message(&mut self, message: Bytes) {
        self.log
            .push(format!("message:{}", String::from_utf8_lossy(&message)));
        if let Some(hook) = &self.on_message {
            hook(&self.call, &message);
        }
    }

    fn on_half_close(&mut self) {
        self.log.push("half_close");
    }

    fn on_cancel(&mut self) {
        self.log.push("cancel");
    }

    fn on_complete(&mut self, status: &Status) {
        let in_context = RequestContext::current().is_some();
        self.log
            .push(format!("complete:{}:{}", status.code(), in_context));
    }

    fn on_ready(&mut self) {
        self.log.push("ready");
    }
}

/// Poll `cond` for up to two seconds
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    cond()
}

pub fn thread_name() -> String {
    std::thread::current().name().unwrap_or_default().to_string()
}
