//! Task Registry
//!
//! Owns every live task by name: spawning, cancellation, self-removal on exit,
//! and a bounded drain on shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    StopReason, Task, TaskCommand, TaskContext, TaskError, TaskHandle, TaskResult, TaskSpec,
    TaskState,
};

// ─────────────────────────────────────────────────────────────────────────────
// Running Task
// ─────────────────────────────────────────────────────────────────────────────

struct RunningTask {
    handle: TaskHandle,
    join_handle: JoinHandle<()>,
    spec: TaskSpec,
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of live tasks, keyed by task name
///
/// A name stays taken until its task has finished `on_stop`, so cleanup that
/// talks to the network cannot overlap with a new task under the same name.
/// Once `shutdown_all` has started the registry refuses new tasks.
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, RunningTask>>,
    closed: AtomicBool,

    /// Bound for `shutdown_all`
    default_shutdown_timeout: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
            default_shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Override the bound used by `shutdown_all`
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.default_shutdown_timeout = timeout;
        self
    }

    /// Spawn a task under its spec name
    ///
    /// Fails with `AlreadyRunning` if the name is taken and with `Closed`
    /// once shutdown has begun.
    pub fn spawn<T: Task>(&self, task: T) -> TaskResult<TaskHandle> {
        let spec = task.spec();
        let name = spec.name.clone();

        // The flag is read under the shard lock; shutdown_all sets it before
        // walking the shards, so every task it misses sees it set.
        match self.tasks.entry(name.clone()) {
            Entry::Occupied(_) => Err(TaskError::AlreadyRunning(name)),
            Entry::Vacant(_) if self.is_closed() => Err(TaskError::Closed),
            Entry::Vacant(slot) => {
                let (command_tx, command_rx) = mpsc::channel(16);
                let (state_tx, state_rx) = watch::channel(TaskState::Starting);
                let status = Arc::new(RwLock::new(serde_json::Value::Null));

                let handle = TaskHandle::new(name.clone(), command_tx, state_rx, Arc::clone(&status));
                let ctx = TaskContext::new(name.clone(), status);

                let instance = handle.instance;
                let tasks = Arc::clone(&self.tasks);
                let shutdown_timeout = spec.shutdown_timeout;

                // The slot stays locked until the insert below, so a task that
                // ends immediately cannot remove itself before it is registered.
                let join_handle = tokio::spawn(async move {
                    run_task_loop(task, ctx, command_rx, state_tx, shutdown_timeout).await;
                    tasks.remove_if(&name, |_, running| running.handle.instance == instance);
                });

                slot.insert(RunningTask {
                    handle: handle.clone(),
                    join_handle,
                    spec,
                });

                Ok(handle)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<TaskHandle> {
        self.tasks.get(name).map(|t| t.handle.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Names of all live tasks
    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Names of live tasks starting with `prefix`
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Cancel a task and wait for it to finish `on_stop`
    ///
    /// The name is released only after `on_stop` returns.
    pub async fn cancel(&self, name: &str) -> TaskResult<()> {
        let (handle, shutdown_timeout) = self
            .tasks
            .get(name)
            .map(|t| (t.handle.clone(), t.spec.shutdown_timeout))
            .ok_or_else(|| TaskError::NotRunning(name.to_string()))?;

        // Already on its way out if the channel is gone
        let _ = handle.cancel().await;

        // on_stop is bounded by the same timeout inside the loop
        let timeout = shutdown_timeout + Duration::from_secs(1);
        let result = match tokio::time::timeout(timeout, handle.stopped()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(task = name, error = %e, "Task ended without stopping");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(task = name, "Task cancellation timed out");
                Err(TaskError::ShutdownTimeout)
            }
        };

        self.release(&handle);
        result
    }

    /// Refuse new tasks, cancel every live one and wait, bounded, for them
    /// to finish `on_stop`
    pub async fn shutdown_all(&self) -> TaskResult<()> {
        self.closed.store(true, Ordering::SeqCst);

        let handles: Vec<TaskHandle> = self
            .tasks
            .iter()
            .map(|entry| entry.value().handle.clone())
            .collect();
        tracing::info!(count = handles.len(), "Cancelling all tasks");

        for handle in &handles {
            let _ = handle.cancel().await;
        }

        let drained = tokio::time::timeout(self.default_shutdown_timeout, async {
            for handle in &handles {
                let _ = handle.stopped().await;
            }
        })
        .await;

        self.tasks.retain(|_, v| !v.handle.is_terminal());

        if drained.is_err() {
            tracing::warn!(remaining = self.tasks.len(), "Some tasks did not stop within timeout");
            return Err(TaskError::ShutdownTimeout);
        }

        Ok(())
    }

    /// Latest status of the live tasks of one kind, with their state
    pub fn statuses_of_kind(&self, kind: &str) -> Vec<(String, TaskState, serde_json::Value)> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().spec.kind == kind)
            .map(|entry| {
                let handle = &entry.value().handle;
                (entry.key().clone(), handle.state(), handle.status())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop the entry of this incarnation, if it is still there
    fn release(&self, handle: &TaskHandle) {
        if let Some((_, running)) = self
            .tasks
            .remove_if(&handle.name, |_, running| running.handle.instance == handle.instance)
        {
            running.join_handle.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_task_loop<T: Task>(
    mut task: T,
    ctx: TaskContext,
    mut command_rx: mpsc::Receiver<TaskCommand>,
    state: watch::Sender<TaskState>,
    shutdown_timeout: Duration,
) {
    state.send_replace(TaskState::Running);
    tracing::debug!(task = %ctx.name, "Task started");

    let reason = {
        let run = task.run(&ctx);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => match result {
                Ok(()) => StopReason::Finished,
                Err(e) => StopReason::Failed(e),
            },
            Some(TaskCommand::Cancel) | None = command_rx.recv() => StopReason::Cancelled,
        }
    };

    state.send_replace(TaskState::Stopping);
    tracing::debug!(task = %ctx.name, reason = ?reason, "Task stopping");

    let stop_result = tokio::time::timeout(shutdown_timeout, task.on_stop(&ctx, &reason)).await;

    let failed = match (&reason, stop_result) {
        (StopReason::Failed(e), _) => {
            tracing::warn!(task = %ctx.name, error = %e, "Task ended with error");
            true
        }
        (_, Ok(Err(e))) => {
            tracing::warn!(task = %ctx.name, error = %e, "Task stop failed");
            true
        }
        (_, Err(_)) => {
            tracing::warn!(task = %ctx.name, "Task stop timed out");
            true
        }
        (_, Ok(Ok(()))) => false,
    };

    let terminal = if failed { TaskState::Failed } else { TaskState::Stopped };
    state.send_replace(terminal);
    tracing::debug!(task = %ctx.name, state = %terminal, "Task ended");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct SleepyTask {
        name: String,
        run_for: Option<Duration>,
        stop_delay: Duration,
        stop_count: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
    }

    impl SleepyTask {
        fn new(name: &str, run_for: Option<Duration>) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let stop_count = Arc::new(AtomicUsize::new(0));
            let cancelled = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name: name.to_string(),
                    run_for,
                    stop_delay: Duration::ZERO,
                    stop_count: Arc::clone(&stop_count),
                    cancelled: Arc::clone(&cancelled),
                },
                stop_count,
                cancelled,
            )
        }

        fn slow_to_stop(mut self, delay: Duration) -> Self {
            self.stop_delay = delay;
            self
        }
    }

    #[async_trait]
    impl Task for SleepyTask {
        fn spec(&self) -> TaskSpec {
            TaskSpec::new(&self.name).with_kind("test")
        }

        async fn run(&mut self, ctx: &TaskContext) -> TaskResult<()> {
            ctx.report_field("phase", serde_json::json!("running"));
            match self.run_for {
                Some(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
                None => std::future::pending().await,
            }
        }

        async fn on_stop(&mut self, _ctx: &TaskContext, reason: &StopReason) -> TaskResult<()> {
            tokio::time::sleep(self.stop_delay).await;
            self.stop_count.fetch_add(1, Ordering::SeqCst);
            if reason.is_cancelled() {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_and_cancel_task() {
        let registry = TaskRegistry::new();
        let (task, stop_count, cancelled) = SleepyTask::new("device:1,analogInput:0", None);

        let handle = registry.spawn(task).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.is_running());
        assert!(registry.contains("device:1,analogInput:0"));
        assert_eq!(handle.status(), serde_json::json!({"phase": "running"}));

        registry.cancel("device:1,analogInput:0").await.unwrap();

        assert!(!registry.contains("device:1,analogInput:0"));
        assert_eq!(stop_count.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), TaskState::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = TaskRegistry::new();
        let (first, _, _) = SleepyTask::new("dup", None);
        let (second, _, _) = SleepyTask::new("dup", None);

        registry.spawn(first).unwrap();
        let result = registry.spawn(second);
        assert!(matches!(result, Err(TaskError::AlreadyRunning(_))));

        registry.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_task_removes_itself() {
        let registry = TaskRegistry::new();
        let (task, stop_count, cancelled) =
            SleepyTask::new("short", Some(Duration::from_millis(10)));

        registry.spawn(task).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!registry.contains("short"));
        assert_eq!(stop_count.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_drains_registry() {
        let registry = TaskRegistry::new().with_shutdown_timeout(Duration::from_secs(5));
        let mut counters = Vec::new();
        for i in 0..5 {
            let (task, stop_count, _) = SleepyTask::new(&format!("task-{i}"), None);
            registry.spawn(task).unwrap();
            counters.push(stop_count);
        }
        assert_eq!(registry.len(), 5);

        registry.shutdown_all().await.unwrap();

        assert!(registry.is_empty());
        for c in counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let registry = TaskRegistry::new();
        let result = registry.cancel("missing").await;
        assert!(matches!(result, Err(TaskError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_names_with_prefix() {
        let registry = TaskRegistry::new();
        let (a, _, _) = SleepyTask::new("device:1,analogInput:0,confirmed", None);
        let (b, _, _) = SleepyTask::new("device:1,analogValue:0,confirmed", None);
        registry.spawn(a).unwrap();
        registry.spawn(b).unwrap();

        let names = registry.names_with_prefix("device:1,analogInput:0,");
        assert_eq!(names, vec!["device:1,analogInput:0,confirmed".to_string()]);

        registry.shutdown_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_reserved_until_stop_finishes() {
        let registry = Arc::new(TaskRegistry::new());
        let (task, stop_count, _) = SleepyTask::new("device:1,analogInput:0,confirmed", None);
        registry.spawn(task.slow_to_stop(Duration::from_secs(2))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancelling = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.cancel("device:1,analogInput:0,confirmed").await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(registry.contains("device:1,analogInput:0,confirmed"));
        assert_eq!(
            registry.get("device:1,analogInput:0,confirmed").unwrap().state(),
            TaskState::Stopping
        );
        let (again, _, _) = SleepyTask::new("device:1,analogInput:0,confirmed", None);
        assert!(matches!(registry.spawn(again), Err(TaskError::AlreadyRunning(_))));

        cancelling.await.unwrap().unwrap();
        assert_eq!(stop_count.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("device:1,analogInput:0,confirmed"));

        let (again, _, _) = SleepyTask::new("device:1,analogInput:0,confirmed", None);
        registry.spawn(again).unwrap();
        registry.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_refused_after_shutdown() {
        let registry = TaskRegistry::new();
        let (task, _, _) = SleepyTask::new("before", None);
        registry.spawn(task).unwrap();

        registry.shutdown_all().await.unwrap();
        assert!(registry.is_closed());

        let (late, stop_count, _) = SleepyTask::new("after", None);
        assert!(matches!(registry.spawn(late), Err(TaskError::Closed)));
        assert!(registry.is_empty());
        assert_eq!(stop_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_statuses_of_kind_carry_state() {
        let registry = TaskRegistry::new();
        let (task, _, _) = SleepyTask::new("device:1,analogValue:1", None);
        registry.spawn(task).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let statuses = registry.statuses_of_kind("test");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, TaskState::Running);
        assert_eq!(statuses[0].2, serde_json::json!({"phase": "running"}));
        assert!(registry.statuses_of_kind("poll").is_empty());

        registry.shutdown_all().await.unwrap();
    }
}
