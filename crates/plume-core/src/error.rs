//! Error taxonomy for calls, configuration, dispatch and codecs.

/// Errors returned to handler code by outbound call operations
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("send_headers() has already been called")]
    HeadersAlreadySent,

    #[error("send_headers() must be called before send_message()")]
    HeadersNotSent,

    #[error("call is already closed")]
    Closed,

    #[error("message of {size} bytes exceeds the limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised while assembling a service; these fail at setup time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{class} is already added with {existing}")]
    DuplicateMapping { class: &'static str, existing: String },

    #[error("{0}")]
    MutuallyExclusive(&'static str),

    #[error("{0} has already been set")]
    AlreadySet(&'static str),

    #[error("route {0} is already registered")]
    DuplicateRoute(String),

    #[error("invalid route {0} (expected: {{package}}.{{Service}}/{{Method}})")]
    InvalidRoute(String),

    #[error("invalid call configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised when a unit of work cannot be handed to an executor
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("executor {0} rejected the task")]
    Rejected(String),

    #[error("task was dropped before it completed")]
    Dropped,

    #[error("task panicked")]
    Panicked,
}

/// Payload serialization errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Invalid metadata keys or values
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid metadata key: {0}")]
    InvalidKey(String),

    #[error("invalid metadata value for key {0}")]
    InvalidValue(String),
}
