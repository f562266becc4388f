//! Credit-based flow control for inbound messages.
//!
//! The handler grants credits with `request(n)`; every message delivered to it
//! consumes one. A peer that sends past the granted window is in violation.

/// Default credits requested by streaming adapters before the first message
pub const DEFAULT_INITIAL_REQUEST: u32 = 1;

/// Credit window of messages the handler is willing to receive
#[derive(Debug, Clone, Default)]
pub struct CreditWindow {
    available: u32,
    granted_total: u64,
    consumed_total: u64,
}

impl CreditWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to consume one credit for an inbound message
    ///
    /// Returns true if a credit was available and consumed, false otherwise
    pub fn try_consume(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        self.consumed_total += 1;
        true
    }

    /// Grant additional credits; saturates instead of wrapping
    pub fn grant(&mut self, amount: u32) {
        self.available = self.available.saturating_add(amount);
        self.granted_total += u64::from(amount);
    }

    /// Credits currently available
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Credits granted over the life of the call
    pub fn granted_total(&self) -> u64 {
        self.granted_total
    }

    /// Messages delivered over the life of the call
    pub fn consumed_total(&self) -> u64 {
        self.consumed_total
    }
}
