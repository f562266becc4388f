//! Wire status codes, call metadata and the status/metadata pair written as trailers.

use crate::error::MetadataError;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Status codes carried in the terminal trailers of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Numeric value as written on the wire
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Parse a numeric code; values outside the known range map to `Unknown`
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Canonical upper-case name, e.g. `RESOURCE_EXHAUSTED`
    pub fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal status of a call.
///
/// The optional cause is kept for local diagnostics only; transports write the
/// code and description, never the cause chain.
#[derive(Clone)]
pub struct Status {
    code: Code,
    description: Option<String>,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Status {
    /// Create a status with the given code and no description
    pub fn new(code: Code) -> Self {
        Self {
            code,
            description: None,
            cause: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok)
    }

    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::new(Code::Cancelled).with_description(description)
    }

    pub fn unknown(description: impl Into<String>) -> Self {
        Self::new(Code::Unknown).with_description(description)
    }

    pub fn invalid_argument(description: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument).with_description(description)
    }

    pub fn deadline_exceeded(description: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded).with_description(description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(Code::NotFound).with_description(description)
    }

    pub fn permission_denied(description: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied).with_description(description)
    }

    pub fn resource_exhausted(description: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted).with_description(description)
    }

    pub fn aborted(description: impl Into<String>) -> Self {
        Self::new(Code::Aborted).with_description(description)
    }

    pub fn unimplemented(description: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented).with_description(description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(Code::Internal).with_description(description)
    }

    pub fn unavailable(description: impl Into<String>) -> Self {
        Self::new(Code::Unavailable).with_description(description)
    }

    pub fn unauthenticated(description: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated).with_description(description)
    }

    /// Set the human-readable description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach the failure that produced this status
    pub fn with_cause(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Shared handle to the cause, for re-attaching it to a derived status
    pub fn shared_cause(&self) -> Option<Arc<dyn StdError + Send + Sync>> {
        self.cause.clone()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<Code> for Status {
    fn from(code: Code) -> Self {
        Self::new(code)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Status");
        s.field("code", &self.code);
        if let Some(description) = &self.description {
            s.field("description", description);
        }
        if let Some(cause) = &self.cause {
            s.field("cause", &format_args!("{}", cause));
        }
        s.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(description) = &self.description {
            write!(f, ": {}", description)?;
        }
        Ok(())
    }
}

impl StdError for Status {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Call metadata (request headers, response headers and trailers)
#[derive(Debug, Clone, Default)]
pub struct Metadata(HeaderMap);

impl Metadata {
    pub fn new() -> Self {
        Self(HeaderMap::new())
    }

    /// Append a value under `key`; keys are normalized to lower case
    pub fn insert(&mut self, key: &str, value: impl AsRef<str>) -> Result<(), MetadataError> {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| MetadataError::InvalidKey(key.to_string()))?;
        let value = HeaderValue::from_str(value.as_ref())
            .map_err(|_| MetadataError::InvalidValue(key.to_string()))?;
        self.0.append(name, value);
        Ok(())
    }

    /// First value stored under `key`, if it is valid ASCII
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Distinct keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.0.keys_len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add every key of `other` that is not already present.
    ///
    /// Keys already present keep all of their current values.
    pub fn merge_absent(&mut self, other: Metadata) {
        if other.is_empty() {
            return;
        }
        let present: Vec<HeaderName> = self.0.keys().cloned().collect();
        for (name, value) in other.0.iter() {
            if !present.contains(name) {
                self.0.append(name.clone(), value.clone());
            }
        }
    }

    pub fn as_headers(&self) -> &HeaderMap {
        &self.0
    }

    pub fn into_headers(self) -> HeaderMap {
        self.0
    }
}

impl From<HeaderMap> for Metadata {
    fn from(headers: HeaderMap) -> Self {
        Self(headers)
    }
}

/// A status together with the metadata to write next to it.
#[derive(Debug, Clone)]
pub struct ResolvedStatus {
    status: Status,
    metadata: Metadata,
}

impl ResolvedStatus {
    pub fn new(status: Status, metadata: Metadata) -> Self {
        Self { status, metadata }
    }

    /// Pair a status with empty metadata
    pub fn of(status: Status) -> Self {
        Self::new(status, Metadata::new())
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn code(&self) -> Code {
        self.status.code()
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.status.cause()
    }

    /// Same status and metadata, with `cause` attached to the status
    pub fn with_cause(self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        Self::new(self.status.with_cause(cause), self.metadata)
    }

    pub fn into_parts(self) -> (Status, Metadata) {
        (self.status, self.metadata)
    }
}

impl From<Status> for ResolvedStatus {
    fn from(status: Status) -> Self {
        Self::of(status)
    }
}
