//! Task Lifecycle Management
//!
//! A task is a long-running unit of work identified by a unique name. Tasks
//! are spawned into a [`TaskRegistry`], which keeps at most one live task per
//! name and removes the entry once the task ends.
//!
//! # Lifecycle
//!
//! - `run`: the body of the task, raced against cancellation
//! - `on_stop`: always called once `run` ends or is cancelled, with the reason
//!
//! `run` must be safe to drop at any await point; cleanup that needs a round
//! trip (for example an unsubscribe) belongs in `on_stop`.

mod handle;
mod registry;

pub use handle::*;
pub use registry::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Task Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during a task lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task already running: {0}")]
    AlreadyRunning(String),

    #[error("Task not running: {0}")]
    NotRunning(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Task registry is shut down")]
    Closed,

    #[error("Task failed: {0}")]
    Failed(String),
}

/// Result type for task operations
pub type TaskResult<T> = Result<T, TaskError>;

// ─────────────────────────────────────────────────────────────────────────────
// Task Spec
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task name, used as the registry key
    pub name: String,

    /// Free-form category, e.g. "subscription" or "poll"
    #[serde(default)]
    pub kind: String,

    /// Upper bound for `on_stop`
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl TaskSpec {
    /// Create a new task spec
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    /// Set the task kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to task lifecycle methods
pub struct TaskContext {
    /// Task name
    pub name: String,

    /// Latest status published by the task
    status: Arc<RwLock<serde_json::Value>>,
}

impl TaskContext {
    pub(crate) fn new(name: String, status: Arc<RwLock<serde_json::Value>>) -> Self {
        Self { name, status }
    }

    /// Replace the published status
    pub fn report(&self, status: serde_json::Value) {
        *self.status.write() = status;
    }

    /// Set a single field of the published status, turning it into an object
    /// if it is not one yet
    pub fn report_field(&self, key: &str, value: serde_json::Value) {
        let mut status = self.status.write();
        if !status.is_object() {
            *status = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = status.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Read back the published status
    pub fn status(&self) -> serde_json::Value {
        self.status.read().clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stop Reason
// ─────────────────────────────────────────────────────────────────────────────

/// Why a task left its `run` body
#[derive(Debug, Clone)]
pub enum StopReason {
    /// Cancelled through the registry or its handle
    Cancelled,
    /// `run` returned `Ok(())`
    Finished,
    /// `run` returned an error
    Failed(TaskError),
}

impl StopReason {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StopReason::Cancelled)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running unit managed by the [`TaskRegistry`]
#[async_trait]
pub trait Task: Send + 'static {
    /// Name, kind and stop bound of this task
    fn spec(&self) -> TaskSpec;

    /// Body of the task
    ///
    /// Returning ends the task. The future is dropped if the task is cancelled.
    async fn run(&mut self, ctx: &TaskContext) -> TaskResult<()>;

    /// Called exactly once after `run` ends, whatever the reason
    async fn on_stop(&mut self, _ctx: &TaskContext, _reason: &StopReason) -> TaskResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
