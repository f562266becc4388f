//! The per-call state machine.
//!
//! `CallState` owns no I/O. Every transition returns a decision that the
//! call adapter acts on while it still holds the state lock, so a decision
//! and the transport write it allows are never separated by another thread.
//!
//! ```text
//! INIT --send_headers--> OPEN --half-close--> HALF_CLOSED --close--> CLOSED
//!   \____________________________ close / cancel ____________________/
//! ```

use plume_core::{CallError, CreditWindow, Status};

/// Lifecycle phase derived from the state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Init,
    Open,
    HalfClosed,
    Closed,
}

/// Whether an outbound write reaches the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Proceed,
    /// The peer cancelled; the write is silently dropped
    Skip,
}

/// What to do with an inbound message
#[derive(Debug, Clone)]
pub enum Inbound {
    Deliver,
    /// Cancelled or closed: drop without notice
    Ignore,
    /// Protocol violation; close the call with this status
    Violation(Status),
}

/// How a successful close finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Close {
    WriteTrailers,
    /// The stream is already gone; only the local state moves to CLOSED
    Silent,
}

#[derive(Debug)]
pub struct CallState {
    headers_sent: bool,
    half_closed: bool,
    cancelled: bool,
    closed: bool,
    credits: CreditWindow,
    messages_sent: u64,
    messages_received: u64,
    max_inbound_message_size: usize,
    max_outbound_message_size: Option<usize>,
}

impl CallState {
    pub fn new(max_inbound_message_size: usize, max_outbound_message_size: Option<usize>) -> Self {
        Self {
            headers_sent: false,
            half_closed: false,
            cancelled: false,
            closed: false,
            credits: CreditWindow::new(),
            messages_sent: 0,
            messages_received: 0,
            max_inbound_message_size,
            max_outbound_message_size,
        }
    }

    pub fn phase(&self) -> CallPhase {
        if self.closed {
            CallPhase::Closed
        } else if self.half_closed {
            CallPhase::HalfClosed
        } else if self.headers_sent {
            CallPhase::Open
        } else {
            CallPhase::Init
        }
    }

    pub fn send_headers(&mut self) -> Result<Write, CallError> {
        if self.closed {
            return Err(CallError::Closed);
        }
        if self.headers_sent {
            return Err(CallError::HeadersAlreadySent);
        }
        self.headers_sent = true;
        Ok(self.write_or_skip())
    }

    pub fn send_message(&mut self, size: usize) -> Result<Write, CallError> {
        if self.closed {
            return Err(CallError::Closed);
        }
        if !self.headers_sent {
            return Err(CallError::HeadersNotSent);
        }
        if self.cancelled {
            return Ok(Write::Skip);
        }
        if let Some(limit) = self.max_outbound_message_size {
            if size > limit {
                return Err(CallError::MessageTooLarge { size, limit });
            }
        }
        self.messages_sent += 1;
        Ok(Write::Proceed)
    }

    pub fn on_message(&mut self, size: usize) -> Inbound {
        if self.closed || self.cancelled {
            return Inbound::Ignore;
        }
        if self.half_closed {
            return Inbound::Violation(Status::internal("message received after half-close"));
        }
        if size > self.max_inbound_message_size {
            return Inbound::Violation(Status::resource_exhausted(format!(
                "inbound message of {} bytes exceeds the limit of {} bytes",
                size, self.max_inbound_message_size
            )));
        }
        if !self.credits.try_consume() {
            return Inbound::Violation(Status::internal(format!(
                "flow-control window exceeded: {} messages requested, message {} received",
                self.credits.granted_total(),
                self.messages_received + 1
            )));
        }
        self.messages_received += 1;
        Inbound::Deliver
    }

    /// Returns true on the first half-close of a live call
    pub fn on_half_close(&mut self) -> bool {
        if self.closed || self.cancelled || self.half_closed {
            return false;
        }
        self.half_closed = true;
        true
    }

    /// Returns true on the first cancellation of a live call
    pub fn on_cancel(&mut self) -> bool {
        if self.closed || self.cancelled {
            return false;
        }
        self.cancelled = true;
        true
    }

    /// Grant `n` more inbound credits; true if the peer should be told
    pub fn request(&mut self, n: u32) -> bool {
        if n == 0 || self.closed || self.cancelled {
            return false;
        }
        self.credits.grant(n);
        true
    }

    /// Move to CLOSED; `None` if the call was already closed
    pub fn close(&mut self) -> Option<Close> {
        if self.closed {
            return None;
        }
        self.closed = true;
        if self.cancelled {
            Some(Close::Silent)
        } else {
            Some(Close::WriteTrailers)
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn credits(&self) -> &CreditWindow {
        &self.credits
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    fn write_or_skip(&self) -> Write {
        if self.cancelled {
            Write::Skip
        } else {
            Write::Proceed
        }
    }
}
