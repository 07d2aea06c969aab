//! Task runtime for bacsync
//!
//! Long-lived background units (subscriptions, pollers) are modelled as named
//! tasks owned by a [`task::TaskRegistry`]. The registry spawns them, routes
//! cancellation, and drains them on shutdown.

pub mod task;

pub use task::{
    StopReason, Task, TaskContext, TaskError, TaskHandle, TaskRegistry, TaskResult, TaskSpec,
    TaskState,
};
