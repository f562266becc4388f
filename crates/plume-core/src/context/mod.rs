//! Request-context propagation across dispatch boundaries.
//!
//! - [`ContextCell`]: the per-thread "current value" slot
//! - [`PropagationFrame`]: one scoped activation of a value
//! - [`ContextBridge`]: value propagation for closures and futures
//! - [`with_affinity`]: pins every poll of a future to one [`Executor`]

pub mod affinity;
pub mod bridge;
pub mod cell;
pub mod executor;

pub use affinity::{spawn_with_affinity, with_affinity, Affinity};
pub use bridge::{ContextBridge, PropagationFrame, WithContext};
pub use cell::ContextCell;
pub use executor::{DirectExecutor, EventLoop, Executor, Task};
