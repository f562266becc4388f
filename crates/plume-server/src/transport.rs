//! The seam between a call and the HTTP/2 transport that carries it.
//!
//! Framing, compression and header encoding live behind [`ServerTransport`];
//! the call only decides *what* to write and *when*.

use bytes::Bytes;
use plume_core::{Metadata, Status};

/// Outbound operations the transport provides for one call.
///
/// The three writes are invoked while the call holds its state lock, which
/// is what keeps headers, messages and trailers in order. They must not block
/// and must not call back into the call's [`TransportListener`].
///
/// `request_more_messages` and `is_ready` run without the lock and may
/// re-enter the listener, e.g. to deliver a message buffered until credit
/// was granted.
pub trait ServerTransport: Send + Sync + 'static {
    fn write_headers(&self, headers: Metadata);

    fn write_message(&self, message: Bytes);

    fn write_trailers(&self, status: &Status, trailers: Metadata);

    /// Tell the peer it may send `n` more messages. May deliver buffered
    /// messages to the listener before returning.
    fn request_more_messages(&self, n: u32);

    /// Whether the outbound side can take more messages without buffering
    fn is_ready(&self) -> bool {
        true
    }
}

/// Inbound events the transport delivers for one call.
///
/// The transport calls these sequentially, in arrival order.
pub trait TransportListener: Send + Sync {
    fn on_message(&self, message: Bytes);

    fn on_half_close(&self);

    fn on_cancel(&self);

    /// Outbound backpressure was relieved
    fn on_ready(&self);
}
