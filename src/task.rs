//! Task descriptors, attempt outcomes and worker snapshots.
//!
//! These are the types that flow through the engine: callers submit
//! [`TestTask`]s, supply a [`TaskExecutor`], and receive one
//! [`TestExecutionResult`] per task.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An independently schedulable test task.
///
/// Tasks are treated as immutable once scheduled. The engine never inspects
/// `file_path`; it is an opaque locator handed to the executor. The copy of
/// the task passed to each attempt carries the current `retry_count`.
///
/// # Example
///
/// ```
/// use stampede::TestTask;
///
/// let task = TestTask::new("auth::login", "tests/test_auth.py")
///     .priority(5)
///     .depends_on("db::migrate")
///     .max_retries(2);
///
/// assert_eq!(task.dependencies, vec!["db::migrate".to_string()]);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestTask {
    /// Unique identity within a batch.
    pub id: String,

    /// Opaque locator passed to the executor.
    pub file_path: String,

    /// Higher values are dispatched first; ties preserve submission order.
    #[serde(default)]
    pub priority: i32,

    /// If true, never runs concurrently with another serialized task.
    #[serde(default)]
    pub requires_serialization: bool,

    /// Ids of tasks that must reach a terminal result before this one
    /// becomes eligible. Must reference tasks in the same batch.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Attempts already consumed. 0 at submission; stamped by the engine
    /// on the copy handed to each attempt.
    #[serde(default)]
    pub retry_count: u32,

    /// Additional attempts allowed after the first failure.
    #[serde(default)]
    pub max_retries: u32,
}

impl TestTask {
    /// Create a task with default priority, no dependencies and no retries.
    pub fn new(id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            priority: 0,
            requires_serialization: false,
            dependencies: Vec::new(),
            retry_count: 0,
            max_retries: 0,
        }
    }

    /// Set the scheduling priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Require this task to hold the pool-wide serialization slot.
    pub fn requires_serialization(mut self, serialized: bool) -> Self {
        self.requires_serialization = serialized;
        self
    }

    /// Add a dependency on another task in the same batch.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Set how many additional attempts are allowed after the first failure.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// What the executor reports for one attempt.
///
/// A failed attempt (`success == false`) is an ordinary, retryable outcome.
/// Executors signal an internal fault by returning `Err(_)` instead, which
/// aborts the whole batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttemptOutcome {
    /// Whether the attempt passed.
    pub success: bool,
    /// Failure message, present iff `!success`.
    pub error: Option<String>,
}

impl AttemptOutcome {
    /// A passing attempt.
    pub fn passed() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failing attempt with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Terminal result for one task, emitted once per scheduled task.
#[derive(Debug, Clone, Serialize)]
pub struct TestExecutionResult {
    /// Id of the task this result belongs to.
    pub task_id: String,

    /// Final outcome polarity.
    pub success: bool,

    /// Failure message, present iff `!success`.
    pub error: Option<String>,

    /// Wall-clock duration of the final attempt.
    pub execution_time: Duration,

    /// Worker that ran the final attempt. `None` only for tasks resolved
    /// without running (skipped after a failed dependency).
    pub worker_id: Option<String>,

    /// Index of the attempt that produced this result (0 = first run).
    pub retry_attempt: u32,

    /// True iff attempts for this task disagreed on success.
    pub is_flaky: bool,

    /// When the terminal result was recorded.
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// State of a logical worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Waiting for a task.
    Idle,
    /// Executing an attempt.
    Busy,
}

/// A logical execution slot in the pool.
///
/// Snapshots of workers are returned by
/// [`WorkerManager::workers`](crate::WorkerManager::workers); mutating a
/// snapshot has no effect on the pool.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    /// Stable identifier, assigned at creation.
    pub id: String,
    /// Current state.
    pub state: WorkerState,
    /// Attempts completed by this worker (monotonic).
    pub completed_tasks: u64,
    /// Memory attributed by the last monitor sample, in MB.
    pub memory_usage_mb: f64,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            id: format!("worker-{index}"),
            state: WorkerState::Idle,
            completed_tasks: 0,
            memory_usage_mb: 0.0,
        }
    }
}

/// Live statistics over the pool, recomputed from worker state on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    /// Workers currently in the pool.
    pub total_workers: usize,
    /// Workers executing an attempt.
    pub active_workers: usize,
    /// Workers waiting for a task.
    pub idle_workers: usize,
    /// Attempts completed across all workers since construction.
    pub total_tasks_completed: u64,
}

/// Caller-supplied execution boundary.
///
/// Invoked once per attempt. Ordinary test failures must be encoded as
/// [`AttemptOutcome::failed`]; returning `Err(_)` signals a fault in the
/// runner itself and aborts the batch without retry.
///
/// Any `Fn(TestTask) -> Future<Output = anyhow::Result<AttemptOutcome>>`
/// closure implements this trait:
///
/// ```
/// use stampede::{AttemptOutcome, TaskExecutor, TestTask};
///
/// fn assert_executor(_e: impl TaskExecutor) {}
///
/// assert_executor(|task: TestTask| async move {
///     Ok(AttemptOutcome::passed())
/// });
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt of `task` and report its outcome.
    async fn execute(&self, task: TestTask) -> anyhow::Result<AttemptOutcome>;
}

#[async_trait]
impl<F, Fut> TaskExecutor for F
where
    F: Fn(TestTask) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<AttemptOutcome>> + Send + 'static,
{
    async fn execute(&self, task: TestTask) -> anyhow::Result<AttemptOutcome> {
        (self)(task).await
    }
}
