//! Core types for the Plume call adapter.
//!
//! This crate provides the foundation types shared by every call:
//! - Status codes, metadata and resolved statuses
//! - Error taxonomy and the classified-error hierarchy
//! - Inbound credit accounting
//! - Payload codecs
//! - Context propagation and executor affinity

pub mod class;
pub mod codec;
pub mod context;
pub mod error;
pub mod flow_control;
pub mod status;

pub use class::{Classified, ErrorClass, ServiceError};
pub use codec::{BytesCodec, Codec, JsonCodec};
pub use context::{
    spawn_with_affinity, with_affinity, Affinity, ContextBridge, ContextCell, DirectExecutor,
    EventLoop, Executor, PropagationFrame,
};
pub use error::{CallError, CodecError, ConfigError, DispatchError, MetadataError};
pub use flow_control::{CreditWindow, DEFAULT_INITIAL_REQUEST};
pub use status::{Code, Metadata, ResolvedStatus, Status};
