//! Per-call configuration

use plume_core::{ConfigError, DEFAULT_INITIAL_REQUEST};
use serde::{Deserialize, Serialize};

/// Default inbound message limit (4MB)
pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Limits and policies applied to every call of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Largest inbound message accepted, in bytes
    pub max_inbound_message_size: usize,
    /// Largest outbound message written, in bytes (None = unlimited)
    pub max_outbound_message_size: Option<usize>,
    /// Put the failure's display text into UNKNOWN statuses
    pub verbose_responses: bool,
    /// Credits streaming adapters request before the first message
    pub initial_request: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_inbound_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
            max_outbound_message_size: None,
            verbose_responses: false,
            initial_request: DEFAULT_INITIAL_REQUEST,
        }
    }
}

impl CallConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_inbound_message_size(mut self, size: usize) -> Self {
        self.max_inbound_message_size = size;
        self
    }

    pub fn max_outbound_message_size(mut self, size: usize) -> Self {
        self.max_outbound_message_size = Some(size);
        self
    }

    pub fn verbose_responses(mut self, verbose: bool) -> Self {
        self.verbose_responses = verbose;
        self
    }

    pub fn initial_request(mut self, credits: u32) -> Self {
        self.initial_request = credits;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_request == 0 {
            return Err(ConfigError::InvalidConfig(
                "initial_request must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
