//! Task dispatcher.
//!
//! Every submitted task gets its own worker (a spawned tokio task) that runs
//! the task's steps in order against the command registry and event bus.
//! There is no fixed pool size; an optional `max_workers` ceiling turns
//! excess submissions into `ResourceExhausted`.
//!
//! Failure policy per step:
//! - NotFound, unrecoverable handler errors and cancellation end the task
//! - any other error fails only that step
//!
//! The task timeout and a monitor-driven abandon (deadlock) end the task
//! wherever it is, dropping the in-flight call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commbus::{CommandRegistry, Event, EventBus};
use crate::kernel::audit::{AuditKind, AuditLog, AuditScope};
use crate::types::{Error, Result, TaskId};

// =============================================================================
// Task model
// =============================================================================

/// One unit of work inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Invoke { command: String, args: Value },
    Emit { event: String, payload: Value },
}

impl Step {
    pub fn invoke(command: impl Into<String>, args: Value) -> Self {
        Step::Invoke {
            command: command.into(),
            args,
        }
    }

    pub fn emit(event: impl Into<String>, payload: Value) -> Self {
        Step::Emit {
            event: event.into(),
            payload,
        }
    }
}

/// Work item submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    label: String,
    steps: Vec<Step>,
    timeout: Option<Duration>,
}

impl Task {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            label: label.into(),
            steps: Vec::new(),
            timeout: None,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn invoke(self, command: impl Into<String>, args: Value) -> Self {
        self.step(Step::invoke(command, args))
    }

    pub fn emit(self, event: impl Into<String>, payload: Value) -> Self {
        self.step(Step::emit(event, payload))
    }

    /// Override the configured task timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// What one completed step produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    Invoked {
        command: String,
        result: Value,
    },
    InvokeFailed {
        command: String,
        error_code: String,
        error: String,
    },
    Emitted {
        event: String,
        delivered: usize,
        failures: usize,
    },
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, StepOutcome::InvokeFailed { .. })
    }
}

/// Why a task ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    NotFound,
    Unrecoverable,
    Timeout,
    Cancelled,
    Deadlock,
}

impl FailureCause {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCause::NotFound => "not_found",
            FailureCause::Unrecoverable => "unrecoverable",
            FailureCause::Timeout => "timeout",
            FailureCause::Cancelled => "cancelled",
            FailureCause::Deadlock => "deadlock",
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure record attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub cause: FailureCause,
    /// Index of the step that was running, if any.
    pub step: Option<usize>,
    pub message: String,
}

impl TaskFailure {
    /// The failure as a runtime error.
    pub fn to_error(&self) -> Error {
        match self.cause {
            FailureCause::NotFound => Error::not_found(self.message.clone()),
            FailureCause::Unrecoverable => Error::unrecoverable(self.message.clone()),
            FailureCause::Timeout => Error::timeout(self.message.clone()),
            FailureCause::Cancelled => Error::cancelled(self.message.clone()),
            FailureCause::Deadlock => Error::deadlock(self.message.clone()),
        }
    }
}

/// Final record of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub label: String,
    /// Outcomes of the steps that completed, in order.
    pub steps: Vec<StepOutcome>,
    pub failure: Option<TaskFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// True when the task ran to the end. Individual steps may still have
    /// failed recoverably.
    pub fn completed(&self) -> bool {
        self.failure.is_none()
    }

    pub fn cause(&self) -> Option<FailureCause> {
        self.failure.as_ref().map(|f| f.cause)
    }
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    cancel: CancellationToken,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Request cooperative cancellation; observed before the next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<TaskOutcome> {
        self.join
            .await
            .map_err(|e| Error::internal(format!("worker for task {} failed: {}", self.id, e)))
    }
}

// =============================================================================
// Workers
// =============================================================================

#[derive(Debug)]
struct Progress {
    step: AtomicUsize,
    last: Mutex<Instant>,
}

impl Progress {
    fn new() -> Self {
        Self {
            step: AtomicUsize::new(0),
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self, step: usize) {
        self.step.store(step, Ordering::Release);
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

#[derive(Debug)]
struct WorkerSlot {
    label: String,
    total_steps: usize,
    started_at: DateTime<Utc>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    abandon: Option<oneshot::Sender<FailureCause>>,
}

/// Live view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub task_id: TaskId,
    pub label: String,
    pub step: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub idle_for: Duration,
}

/// Dispatcher counters.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub rejected: u64,
    pub active: usize,
}

/// Dispatcher configuration derived from the runtime config.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub task_timeout: Duration,
    pub max_workers: Option<usize>,
}

/// Runs tasks on independent workers.
#[derive(Debug)]
pub struct Dispatcher {
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    audit: Arc<AuditLog>,
    settings: DispatcherSettings,
    workers: Arc<RwLock<HashMap<TaskId, WorkerSlot>>>,
    stats: Arc<RwLock<DispatcherStats>>,
}

struct WorkerRun {
    commands: Arc<CommandRegistry>,
    events: Arc<EventBus>,
    task: Task,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    record: Arc<Mutex<Vec<StepOutcome>>>,
}

impl Dispatcher {
    pub fn new(
        commands: Arc<CommandRegistry>,
        events: Arc<EventBus>,
        audit: Arc<AuditLog>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            commands,
            events,
            audit,
            settings,
            workers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(DispatcherStats::default())),
        }
    }

    /// Start `task` on a fresh worker.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle> {
        let id = task.id.clone();
        let label = task.label.clone();
        let timeout = task.timeout.unwrap_or(self.settings.task_timeout);
        let progress = Arc::new(Progress::new());
        let cancel = CancellationToken::new();
        let (abandon_tx, abandon_rx) = oneshot::channel();

        {
            let mut workers = self.workers.write().await;
            if let Some(max) = self.settings.max_workers {
                if workers.len() >= max {
                    self.stats.write().await.rejected += 1;
                    tracing::warn!(task_id = %id, max, "worker_pool_exhausted");
                    return Err(Error::resource_exhausted(format!(
                        "{} workers already running",
                        max
                    )));
                }
            }
            workers.insert(
                id.clone(),
                WorkerSlot {
                    label: label.clone(),
                    total_steps: task.steps.len(),
                    started_at: Utc::now(),
                    progress: progress.clone(),
                    cancel: cancel.clone(),
                    abandon: Some(abandon_tx),
                },
            );
            let mut stats = self.stats.write().await;
            stats.submitted += 1;
            stats.active = workers.len();
        }

        tracing::debug!(task_id = %id, label = %label, steps = task.steps.len(), "task_submitted");

        let run = WorkerRun {
            commands: self.commands.clone(),
            events: self.events.clone(),
            task,
            progress,
            cancel: cancel.clone(),
            record: Arc::new(Mutex::new(Vec::new())),
        };
        let workers = self.workers.clone();
        let stats = self.stats.clone();
        let audit = self.audit.clone();
        let task_id = id.clone();

        let join = tokio::spawn(async move {
            let started_at = Utc::now();
            let record = run.record.clone();
            let progress = run.progress.clone();
            let mut abandon_rx = abandon_rx;

            let failure = tokio::select! {
                Ok(cause) = &mut abandon_rx => Some(TaskFailure {
                    cause,
                    step: Some(progress.step.load(Ordering::Acquire)),
                    message: format!("worker abandoned: {}", cause),
                }),
                _ = tokio::time::sleep(timeout) => Some(TaskFailure {
                    cause: FailureCause::Timeout,
                    step: Some(progress.step.load(Ordering::Acquire)),
                    message: format!("task exceeded {:?}", timeout),
                }),
                failure = run.execute() => failure,
            };

            let steps = std::mem::take(&mut *record.lock().unwrap_or_else(|p| p.into_inner()));
            let outcome = TaskOutcome {
                task_id: task_id.clone(),
                label,
                steps,
                failure,
                started_at,
                finished_at: Utc::now(),
            };

            {
                let mut workers = workers.write().await;
                workers.remove(&task_id);
                let mut stats = stats.write().await;
                stats.active = workers.len();
                match outcome.cause() {
                    None => stats.completed += 1,
                    Some(FailureCause::Deadlock) => {
                        stats.failed += 1;
                        stats.abandoned += 1;
                    }
                    Some(_) => stats.failed += 1,
                }
            }

            match &outcome.failure {
                None => tracing::debug!(task_id = %task_id, steps = outcome.steps.len(), "task_completed"),
                Some(f) => tracing::warn!(
                    task_id = %task_id,
                    cause = %f.cause,
                    step = ?f.step,
                    message = %f.message,
                    "task_failed"
                ),
            }
            audit.record(
                AuditScope::task(&task_id),
                AuditKind::TaskFinished {
                    label: outcome.label.clone(),
                    ok: outcome.completed(),
                    cause: outcome.cause().map(|c| c.to_string()),
                    steps: outcome.steps.len(),
                },
            );
            outcome
        });

        Ok(TaskHandle { id, cancel, join })
    }

    /// Submit and wait.
    pub async fn run(&self, task: Task) -> Result<TaskOutcome> {
        self.submit(task).await?.join().await
    }

    /// Workers that made no progress for longer than `threshold`.
    pub async fn stalled(&self, threshold: Duration) -> Vec<TaskId> {
        self.workers
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.progress.idle_for() > threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// End a worker's task with `cause` without waiting for its current
    /// call. Returns false if the worker is gone or already abandoned.
    pub async fn abandon(&self, id: &TaskId, cause: FailureCause) -> bool {
        let sender = self
            .workers
            .write()
            .await
            .get_mut(id)
            .and_then(|slot| slot.abandon.take());
        match sender {
            Some(tx) => {
                tracing::warn!(task_id = %id, cause = %cause, "worker_abandoned");
                tx.send(cause).is_ok()
            }
            None => false,
        }
    }

    pub async fn cancel(&self, id: &TaskId) -> bool {
        match self.workers.read().await.get(id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running task.
    pub async fn cancel_all(&self) -> usize {
        let workers = self.workers.read().await;
        for slot in workers.values() {
            slot.cancel.cancel();
        }
        workers.len()
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<WorkerSnapshot> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(id, slot)| WorkerSnapshot {
                task_id: id.clone(),
                label: slot.label.clone(),
                step: slot.progress.step.load(Ordering::Acquire),
                total_steps: slot.total_steps,
                started_at: slot.started_at,
                idle_for: slot.progress.idle_for(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    pub async fn active(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn stats(&self) -> DispatcherStats {
        self.stats.read().await.clone()
    }
}

impl WorkerRun {
    fn push(&self, outcome: StepOutcome) {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(outcome);
    }

    /// Run every step; `Some` on terminal failure.
    async fn execute(&self) -> Option<TaskFailure> {
        let task_id = &self.task.id;
        let source = format!("task:{}", self.task.label);

        for (index, step) in self.task.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Some(TaskFailure {
                    cause: FailureCause::Cancelled,
                    step: Some(index),
                    message: "cancelled before step".to_string(),
                });
            }
            self.progress.touch(index);

            match step {
                Step::Invoke { command, args } => {
                    match self
                        .commands
                        .invoke_for(command, args.clone(), Some(task_id))
                        .await
                    {
                        Ok(result) => self.push(StepOutcome::Invoked {
                            command: command.clone(),
                            result,
                        }),
                        Err(e) => {
                            self.push(StepOutcome::InvokeFailed {
                                command: command.clone(),
                                error_code: e.code().to_string(),
                                error: e.to_string(),
                            });
                            // The registry reports NotFound only for a miss on `command`
                            let cause = match e {
                                Error::NotFound(_) => Some(FailureCause::NotFound),
                                Error::Unrecoverable(_) => Some(FailureCause::Unrecoverable),
                                Error::Cancelled(_) => Some(FailureCause::Cancelled),
                                _ => None,
                            };
                            if let Some(cause) = cause {
                                return Some(TaskFailure {
                                    cause,
                                    step: Some(index),
                                    message: e.to_string(),
                                });
                            }
                            tracing::debug!(task_id = %task_id, command = %command, error = %e, "step_failed");
                        }
                    }
                }
                Step::Emit { event, payload } => {
                    let report = self
                        .events
                        .publish(
                            Event::new(event.clone(), payload.clone(), source.clone())
                                .with_task(Some(task_id.clone())),
                        )
                        .await;
                    self.push(StepOutcome::Emitted {
                        event: event.clone(),
                        delivered: report.delivered,
                        failures: report.failures.len(),
                    });
                }
            }
            self.progress.touch(index + 1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commbus::OwnerRef;
    use crate::types::TimeoutConfig;
    use serde_json::json;

    fn dispatcher(max_workers: Option<usize>) -> (Dispatcher, Arc<CommandRegistry>, Arc<EventBus>) {
        let audit = Arc::new(AuditLog::in_memory());
        let timeouts = TimeoutConfig::default();
        let commands = Arc::new(CommandRegistry::new(timeouts.clone(), audit.clone()));
        let events = Arc::new(EventBus::new(timeouts, audit.clone()));
        let dispatcher = Dispatcher::new(
            commands.clone(),
            events.clone(),
            audit,
            DispatcherSettings {
                task_timeout: Duration::from_secs(5),
                max_workers,
            },
        );
        (dispatcher, commands, events)
    }

    #[tokio::test]
    async fn test_runs_steps_in_order() {
        let (dispatcher, commands, _events) = dispatcher(None);
        let owner = OwnerRef::host();
        commands
            .register(&owner, "math.double", Arc::new(|args: Value| async move {
                Ok::<Value, Error>(json!(args["n"].as_i64().unwrap_or(0) * 2))
            }))
            .await
            .unwrap();

        let outcome = dispatcher
            .run(
                Task::new("doubling")
                    .invoke("math.double", json!({"n": 2}))
                    .emit("math.done", json!({}))
                    .invoke("math.double", json!({"n": 5})),
            )
            .await
            .unwrap();

        assert!(outcome.completed());
        assert_eq!(outcome.steps.len(), 3);
        assert_eq!(
            outcome.steps[2],
            StepOutcome::Invoked {
                command: "math.double".to_string(),
                result: json!(10)
            }
        );
        assert_eq!(dispatcher.stats().await.completed, 1);
        assert_eq!(dispatcher.active().await, 0);
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let (dispatcher, _commands, _events) = dispatcher(None);
        let outcome = dispatcher
            .run(Task::new("t").invoke("missing", json!({})).emit("never", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome.cause(), Some(FailureCause::NotFound));
        assert_eq!(outcome.failure.unwrap().step, Some(0));
        assert_eq!(outcome.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_recoverable_failure_continues() {
        let (dispatcher, commands, _events) = dispatcher(None);
        let owner = OwnerRef::host();
        commands
            .register(&owner, "flaky", Arc::new(|_args: Value| async move {
                Err::<Value, Error>(Error::handler("nope"))
            }))
            .await
            .unwrap();
        commands
            .register(&owner, "fatal", Arc::new(|_args: Value| async move {
                Err::<Value, Error>(Error::unrecoverable("boom"))
            }))
            .await
            .unwrap();

        let outcome = dispatcher
            .run(
                Task::new("t")
                    .invoke("flaky", json!({}))
                    .invoke("fatal", json!({}))
                    .invoke("flaky", json!({})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.cause(), Some(FailureCause::Unrecoverable));
        assert_eq!(outcome.steps.len(), 2);
        assert!(!outcome.steps[0].is_ok());
    }

    #[tokio::test]
    async fn test_not_found_raised_by_handler_only_fails_step() {
        let (dispatcher, commands, _events) = dispatcher(None);
        commands
            .register(&OwnerRef::host(), "ask", Arc::new(|_args: Value| async move {
                Err::<Value, Error>(Error::not_found("no model provider attached"))
            }))
            .await
            .unwrap();
        commands
            .register(&OwnerRef::host(), "after", Arc::new(|_args: Value| async move {
                Ok::<Value, Error>(json!("ran"))
            }))
            .await
            .unwrap();

        let outcome = dispatcher
            .run(Task::new("t").invoke("ask", json!({})).invoke("after", json!({})))
            .await
            .unwrap();
        assert!(outcome.completed(), "{:?}", outcome.failure);
        assert!(matches!(
            &outcome.steps[0],
            StepOutcome::InvokeFailed { error_code, .. } if error_code == "HANDLER_ERROR"
        ));
        assert!(outcome.steps[1].is_ok());
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let (dispatcher, commands, _events) = dispatcher(None);
        commands
            .register(&OwnerRef::host(), "slow", Arc::new(|_args: Value| async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<Value, Error>(Value::Null)
            }))
            .await
            .unwrap();

        let outcome = dispatcher
            .run(
                Task::new("t")
                    .invoke("slow", json!({}))
                    .with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.cause(), Some(FailureCause::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let (dispatcher, commands, _events) = dispatcher(None);
        commands
            .register(&OwnerRef::host(), "pause", Arc::new(|_args: Value| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<Value, Error>(Value::Null)
            }))
            .await
            .unwrap();

        let handle = dispatcher
            .submit(Task::new("t").invoke("pause", json!({})).invoke("pause", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.cause(), Some(FailureCause::Cancelled));
        // The in-flight call finished; the second never started
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].is_ok());
    }

    #[tokio::test]
    async fn test_max_workers_rejects() {
        let (dispatcher, commands, _events) = dispatcher(Some(1));
        commands
            .register(&OwnerRef::host(), "pause", Arc::new(|_args: Value| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<Value, Error>(Value::Null)
            }))
            .await
            .unwrap();

        let first = dispatcher.submit(Task::new("a").invoke("pause", json!({}))).await.unwrap();
        let second = dispatcher.submit(Task::new("b").invoke("pause", json!({}))).await;
        assert!(matches!(second, Err(Error::ResourceExhausted(_))));
        assert!(first.join().await.unwrap().completed());
        assert_eq!(dispatcher.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn test_stalled_worker_abandoned() {
        let (dispatcher, commands, _events) = dispatcher(None);
        commands
            .register(&OwnerRef::host(), "hang", Arc::new(|_args: Value| async move {
                std::future::pending::<()>().await;
                Ok::<Value, Error>(Value::Null)
            }))
            .await
            .unwrap();

        let handle = dispatcher.submit(Task::new("stuck").invoke("hang", json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stalled = dispatcher.stalled(Duration::from_millis(30)).await;
        assert_eq!(stalled, vec![handle.id().clone()]);
        assert_eq!(dispatcher.workers().await.len(), 1);
        assert!(dispatcher.abandon(&stalled[0], FailureCause::Deadlock).await);
        assert!(!dispatcher.abandon(&stalled[0], FailureCause::Deadlock).await);

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.cause(), Some(FailureCause::Deadlock));
        assert_eq!(dispatcher.stats().await.abandoned, 1);
    }
}
