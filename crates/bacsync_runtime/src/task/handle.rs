//! Task Handle
//!
//! Cheap, cloneable view of one task incarnation: its state, its published
//! status, and a way to ask it to stop.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{TaskError, TaskResult};

// ─────────────────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────────────────

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Spawned, `run` not entered yet
    Starting,
    /// Inside `run`
    Running,
    /// Inside `on_stop`
    Stopping,
    /// Ended cleanly
    Stopped,
    /// Ended with an error
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Failed)
    }

    pub fn is_running(&self) -> bool {
        *self == TaskState::Running
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum TaskCommand {
    /// Leave `run` and go through `on_stop`
    Cancel,
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one incarnation of a named task
///
/// Dropping every handle does not stop the task; the registry holds one for
/// as long as the task is alive.
#[derive(Clone)]
pub struct TaskHandle {
    pub name: String,

    /// Tells apart two tasks that held the same name at different times
    pub instance: Uuid,

    command_tx: mpsc::Sender<TaskCommand>,
    state: watch::Receiver<TaskState>,
    status: Arc<RwLock<serde_json::Value>>,
}

impl TaskHandle {
    pub(crate) fn new(
        name: String,
        command_tx: mpsc::Sender<TaskCommand>,
        state: watch::Receiver<TaskState>,
        status: Arc<RwLock<serde_json::Value>>,
    ) -> Self {
        Self {
            name,
            instance: Uuid::new_v4(),
            command_tx,
            state,
            status,
        }
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Latest status reported by the task
    pub fn status(&self) -> serde_json::Value {
        self.status.read().clone()
    }

    /// Ask the task to stop; does not wait for `on_stop`
    pub async fn cancel(&self) -> TaskResult<()> {
        self.command_tx
            .send(TaskCommand::Cancel)
            .await
            .map_err(|_| TaskError::NotRunning(self.name.clone()))
    }

    /// Wait until the task has finished `on_stop`
    ///
    /// Errors if the task went away without reaching a terminal state, which
    /// only happens when it panicked.
    pub async fn stopped(&self) -> TaskResult<TaskState> {
        let mut state = self.state.clone();
        let terminal = state
            .wait_for(TaskState::is_terminal)
            .await
            .map(|state| *state)
            .map_err(|_| TaskError::Failed(format!("Task panicked: {}", self.name)));
        terminal
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .finish()
    }
}
