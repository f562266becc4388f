//! Call lifecycle through the service: ordering, flow control, limits,
//! cancellation and close semantics.

mod support;

use bytes::Bytes;
use plume_core::{BytesCodec, CallError, Code, JsonCodec, Metadata, ServiceError, Status};
use plume_server::{
    CallConfig, CallPhase, CallService, RequestContext, RequestStream, ResponseSink,
    ServerTransport, TransportListener,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{RecordingHandler, RecordingTransport, Written, ECHO};
use tokio::sync::Notify;

fn echo_service(config: CallConfig) -> CallService {
    CallService::builder()
        .config(config)
        .unary(ECHO, BytesCodec, |_ctx: RequestContext, req: Bytes| async move {
            Ok::<_, ServiceError>(req)
        })
        .unwrap()
        .build()
        .unwrap()
}

fn raw_service(handler: RecordingHandler, config: CallConfig) -> CallService {
    CallService::builder()
        .config(config)
        .register(ECHO, BytesCodec, handler)
        .unwrap()
        .build()
        .unwrap()
}

#[test]
fn test_unary_writes_headers_message_then_trailers() {
    let service = echo_service(CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"hello"));
    call.on_half_close();

    let writes = transport.writes();
    assert_eq!(writes.len(), 4, "{:?}", writes);
    assert!(matches!(writes[0], Written::Request(1)));
    assert!(matches!(writes[1], Written::Headers(_)));
    assert!(matches!(&writes[2], Written::Message(m) if m.as_ref() == b"hello"));
    assert!(matches!(writes[3], Written::Trailers { code: Code::Ok, .. }));
}

#[test]
fn test_second_message_past_credit_closes_with_internal() {
    let handler = RecordingHandler::new(1);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"a"));
    call.on_message(Bytes::from_static(b"b"));

    assert_eq!(handler.log.entries(), ["message:a", "complete:INTERNAL:true"]);
    let (code, description) = transport.status().unwrap();
    assert_eq!(code, Code::Internal);
    assert!(description.unwrap().contains("flow-control window exceeded"));
    assert_eq!(service.metrics().snapshot(ECHO).violations, 1);

    // Anything after the close is dropped
    call.on_message(Bytes::from_static(b"c"));
    assert_eq!(transport.trailer_count(), 1);
}

#[test]
fn test_credits_granted_later_admit_more_messages() {
    let handler = RecordingHandler::new(1);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"a"));
    handler.call().request(2);
    call.on_message(Bytes::from_static(b"b"));
    call.on_message(Bytes::from_static(b"c"));

    assert_eq!(handler.log.entries(), ["message:a", "message:b", "message:c"]);
    assert_eq!(transport.requested(), 3);
    assert_eq!(transport.trailer_count(), 0);
}

#[test]
fn test_message_after_half_close_is_internal() {
    let handler = RecordingHandler::new(5);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_half_close();
    assert_eq!(handler.call().phase(), CallPhase::HalfClosed);
    call.on_message(Bytes::from_static(b"late"));

    assert_eq!(handler.log.entries(), ["half_close", "complete:INTERNAL:true"]);
    assert_eq!(transport.code(), Some(Code::Internal));
}

#[test]
fn test_oversized_inbound_message_is_resource_exhausted() {
    let handler = RecordingHandler::new(1);
    let config = CallConfig::new().max_inbound_message_size(4);
    let service = raw_service(handler.clone(), config);
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"too long"));

    assert_eq!(transport.code(), Some(Code::ResourceExhausted));
    assert_eq!(handler.log.count("message"), 0);
}

#[test]
fn test_oversized_response_is_resource_exhausted() {
    let service = echo_service(CallConfig::new().max_outbound_message_size(2));
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"hello"));
    call.on_half_close();

    assert!(transport.messages().is_empty());
    assert_eq!(transport.code(), Some(Code::ResourceExhausted));
    assert_eq!(transport.trailer_count(), 1);
}

#[test]
fn test_undecodable_request_is_internal() {
    let service = CallService::builder()
        .unary(
            ECHO,
            JsonCodec::<serde_json::Value, serde_json::Value>::new(),
            |_ctx: RequestContext, req: serde_json::Value| async move {
                Ok::<_, ServiceError>(req)
            },
        )
        .unwrap()
        .build()
        .unwrap();
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"{not json"));

    assert_eq!(transport.code(), Some(Code::Internal));
}

#[test]
fn test_unknown_method_is_unimplemented() {
    let service = echo_service(CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call("echo.v1.EchoService/Missing", Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"ignored"));
    call.on_half_close();

    let (code, description) = transport.status().unwrap();
    assert_eq!(code, Code::Unimplemented);
    assert!(description.unwrap().contains("echo.v1.EchoService/Missing"));
    assert_eq!(transport.writes().len(), 1);
}

#[test]
fn test_header_ordering_rules() {
    let handler = RecordingHandler::new(0);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();
    let _call = service.start_call(ECHO, Metadata::new(), transport.clone());
    let call = handler.call();

    assert!(matches!(
        call.send_message(&Bytes::from_static(b"x")),
        Err(CallError::HeadersNotSent)
    ));
    let mut headers = Metadata::new();
    headers.insert("x-trace", "abc").unwrap();
    call.send_headers(headers).unwrap();
    assert_eq!(call.phase(), CallPhase::Open);
    assert!(matches!(
        call.send_headers(Metadata::new()),
        Err(CallError::HeadersAlreadySent)
    ));
}

#[test]
fn test_close_is_idempotent() {
    let handler = RecordingHandler::new(1);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();
    let _call = service.start_call(ECHO, Metadata::new(), transport.clone());
    let call = handler.call();

    assert!(call.close(Status::ok(), Metadata::new()));
    assert!(!call.close(Status::internal("again"), Metadata::new()));

    assert_eq!(transport.trailer_count(), 1);
    assert_eq!(transport.code(), Some(Code::Ok));
    assert_eq!(handler.log.count("complete"), 1);
    assert!(matches!(
        call.send_headers(Metadata::new()),
        Err(CallError::Closed)
    ));
}

#[test]
fn test_cancel_turns_writes_into_noops() {
    let handler = RecordingHandler::new(1);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();
    let listener = service.start_call(ECHO, Metadata::new(), transport.clone());
    let call = handler.call();

    listener.on_cancel();
    listener.on_cancel();
    assert!(call.is_cancelled());

    call.send_headers(Metadata::new()).unwrap();
    call.send_message(&Bytes::from_static(b"dropped")).unwrap();
    assert!(call.close(Status::ok(), Metadata::new()));

    // Only the initial credit request reached the transport
    assert_eq!(transport.writes().len(), 1);
    assert_eq!(handler.log.entries(), ["cancel", "complete:OK:true"]);
    assert_eq!(service.metrics().snapshot(ECHO).cancelled, 1);
}

#[test]
fn test_close_from_inside_listener_is_delivered_after_callback() {
    let handler = RecordingHandler::new(2).on_message(|call, _| {
        call.close(Status::ok(), Metadata::new());
    });
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"a"));
    call.on_message(Bytes::from_static(b"b"));

    assert_eq!(handler.log.entries(), ["message:a", "complete:OK:true"]);
}

#[test]
fn test_ready_is_forwarded() {
    let handler = RecordingHandler::new(0);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    transport.set_ready(false);
    assert!(!handler.call().is_ready());
    transport.set_ready(true);
    call.on_ready();

    assert_eq!(handler.log.entries(), ["ready"]);
    assert!(handler.call().is_ready());
}

#[test]
fn test_unary_cancel_before_half_close_closes_silently() {
    let service = echo_service(CallConfig::default());
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"hello"));
    call.on_cancel();

    assert_eq!(transport.trailer_count(), 0);
    let stats = service.metrics().snapshot(ECHO);
    assert_eq!(stats.completed_with(Code::Cancelled), 1);
    assert_eq!(service.metrics().calls_in_flight(), 0);
}

#[test]
fn test_server_streaming_sends_each_response() {
    let service = CallService::builder()
        .server_streaming(
            ECHO,
            BytesCodec,
            |_ctx: RequestContext, req: Bytes, sink: ResponseSink<BytesCodec>| async move {
                for i in 0..3 {
                    sink.send(&Bytes::from(format!("{}-{}", String::from_utf8_lossy(&req), i)))?;
                }
                Ok::<_, ServiceError>(())
            },
        )
        .unwrap()
        .build()
        .unwrap();
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"tick"));
    call.on_half_close();

    let messages = transport.messages();
    assert_eq!(messages, [
        Bytes::from_static(b"tick-0"),
        Bytes::from_static(b"tick-1"),
        Bytes::from_static(b"tick-2"),
    ]);
    assert_eq!(transport.code(), Some(Code::Ok));
    let headers = transport
        .writes()
        .iter()
        .filter(|w| matches!(w, Written::Headers(_)))
        .count();
    assert_eq!(headers, 1);
}

#[test]
fn test_client_streaming_grants_one_credit_per_message() {
    let service = CallService::builder()
        .client_streaming(
            ECHO,
            BytesCodec,
            |_ctx: RequestContext, mut requests: RequestStream<BytesCodec>| async move {
                let mut total = 0;
                while let Some(message) = requests.message().await {
                    total += message?.len();
                }
                Ok::<_, ServiceError>(Bytes::from(total.to_string()))
            },
        )
        .unwrap()
        .build()
        .unwrap();
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    assert_eq!(transport.requested(), 1);
    call.on_message(Bytes::from_static(b"ab"));
    call.on_message(Bytes::from_static(b"cde"));
    call.on_half_close();

    assert_eq!(transport.requested(), 3);
    assert_eq!(transport.messages(), [Bytes::from_static(b"5")]);
    assert_eq!(transport.code(), Some(Code::Ok));
}

#[test]
fn test_client_stream_sees_error_when_call_fails() {
    let gate = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (handler_gate, handler_seen) = (Arc::clone(&gate), Arc::clone(&seen));
    let service = CallService::builder()
        .client_streaming(
            ECHO,
            BytesCodec,
            move |_ctx: RequestContext, mut requests: RequestStream<BytesCodec>| {
                let gate = Arc::clone(&handler_gate);
                let seen = Arc::clone(&handler_seen);
                async move {
                    // Hold off reading so no further credit is granted
                    gate.notified().await;
                    while let Some(message) = requests.message().await {
                        let entry = match message {
                            Ok(m) => format!("message:{}", String::from_utf8_lossy(&m)),
                            Err(status) => format!("error:{}", status.code()),
                        };
                        seen.lock().unwrap().push(entry);
                    }
                    Ok::<_, ServiceError>(Bytes::new())
                }
            },
        )
        .unwrap()
        .build()
        .unwrap();
    let transport = RecordingTransport::new();

    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"a"));
    call.on_message(Bytes::from_static(b"b"));
    assert_eq!(transport.code(), Some(Code::Internal));

    gate.notify_one();
    assert_eq!(*seen.lock().unwrap(), ["message:a", "error:INTERNAL"]);
    assert_eq!(transport.trailer_count(), 1);
}

#[test]
fn test_transport_may_deliver_from_credit_grant() {
    let handler = RecordingHandler::new(0);
    let service = raw_service(handler.clone(), CallConfig::default());
    let transport = BufferingTransport::new(Bytes::from_static(b"buffered"));

    let listener = service.start_call(ECHO, Metadata::new(), transport.clone());
    transport.attach(listener);

    let call = handler.call();
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        call.request(1);
        let _ = done_tx.send(());
    });

    assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok(), "request(1) did not return");
    assert_eq!(handler.log.entries(), ["message:buffered"]);
}

/// Holds one inbound message until the call grants credit, then delivers it
/// from inside `request_more_messages`.
struct BufferingTransport {
    buffered: Mutex<Option<Bytes>>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
}

impl BufferingTransport {
    fn new(message: Bytes) -> Arc<Self> {
        Arc::new(Self {
            buffered: Mutex::new(Some(message)),
            listener: Mutex::new(None),
        })
    }

    fn attach(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}

impl ServerTransport for BufferingTransport {
    fn write_headers(&self, _headers: Metadata) {}

    fn write_message(&self, _message: Bytes) {}

    fn write_trailers(&self, _status: &Status, _trailers: Metadata) {}

    fn request_more_messages(&self, _n: u32) {
        let listener = self.listener.lock().unwrap().clone();
        let message = self.buffered.lock().unwrap().take();
        if let (Some(listener), Some(message)) = (listener, message) {
            listener.on_message(message);
        }
    }
}

#[test]
fn test_bidi_echo_and_peer_cancel() {
    let service = CallService::builder()
        .bidi_streaming(
            ECHO,
            BytesCodec,
            |_ctx: RequestContext,
             mut requests: RequestStream<BytesCodec>,
             sink: ResponseSink<BytesCodec>| async move {
                while let Some(message) = requests.message().await {
                    sink.send(&message?)?;
                }
                Ok::<_, ServiceError>(())
            },
        )
        .unwrap()
        .build()
        .unwrap();

    let transport = RecordingTransport::new();
    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"one"));
    call.on_message(Bytes::from_static(b"two"));
    call.on_half_close();
    assert_eq!(
        transport.messages(),
        [Bytes::from_static(b"one"), Bytes::from_static(b"two")]
    );
    assert_eq!(transport.code(), Some(Code::Ok));

    let transport = RecordingTransport::new();
    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"one"));
    call.on_cancel();
    assert_eq!(transport.messages(), [Bytes::from_static(b"one")]);
    assert_eq!(transport.trailer_count(), 0);
    assert_eq!(service.metrics().calls_in_flight(), 0);
}

#[test]
fn test_metrics_exported_for_completed_calls() {
    let service = echo_service(CallConfig::default());
    let transport = RecordingTransport::new();
    let call = service.start_call(ECHO, Metadata::new(), transport.clone());
    call.on_message(Bytes::from_static(b"hi"));
    call.on_half_close();

    let stats = service.metrics().snapshot(ECHO);
    assert_eq!(stats.started, 1);
    assert_eq!(stats.completed_with(Code::Ok), 1);
    let text = service.metrics().export_prometheus();
    assert!(text.contains("plume_calls_completed_total{method=\"echo.v1.EchoService/Echo\",code=\"OK\"} 1"));
}
