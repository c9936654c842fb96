//! The worker pool, lifecycle state machine and batch execution loop.
//!
//! [`WorkerManager`] owns a set of logical workers and drives one batch of
//! tasks at a time through a caller-supplied [`TaskExecutor`]. A single
//! scheduler loop owns all dispatch decisions; workers never touch each
//! other's state. Attempts run as spawned tasks and report back through one
//! mpsc channel, which linearizes completions: a dependent task never
//! becomes eligible before its dependency's terminal result is recorded.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──shutdown()──► ShuttingDown ──drained/timeout──► Stopped
//! ```
//!
//! Scheduling is rejected as soon as shutdown begins. In-flight attempts are
//! drained (up to the shutdown timeout); `Stopped` clears the worker list
//! and is terminal.
//!
//! # Example
//!
//! ```no_run
//! use stampede::{AttemptOutcome, TestTask, WorkerManager, WorkerManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = WorkerManager::new(WorkerManagerConfig::default())?;
//!
//!     manager.schedule_task(TestTask::new("smoke", "tests/test_smoke.py"))?;
//!
//!     let results = manager
//!         .execute_tasks(|task: TestTask| async move {
//!             // launch the test behind `task.file_path` here
//!             Ok(AttemptOutcome::passed())
//!         })
//!         .await?;
//!
//!     assert!(results.iter().all(|r| r.success));
//!     manager.shutdown(None).await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ConfigUpdate, RetryConfig, WorkerManagerConfig};
use crate::monitor;
use crate::retry::{AttemptRecord, FlakyTestReport, RetryManager};
use crate::scheduler::{BatchError, DispatchQueue};
use crate::task::{
    AttemptOutcome, PoolStatistics, TaskExecutor, TestExecutionResult, TestTask, Worker,
    WorkerState,
};

/// Errors surfaced by [`WorkerManager`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("manager is stopped")]
    Stopped,

    #[error("a batch is already executing")]
    BatchInProgress,

    #[error(transparent)]
    InvalidBatch(#[from] BatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("executor fault while running task `{task_id}`: {source}")]
    ExecutorFault {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("scheduler stalled with {0} unresolved tasks")]
    Stalled(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug)]
struct PoolState {
    phase: Phase,
    config: WorkerManagerConfig,
    workers: Vec<Worker>,
    pending: Vec<TestTask>,
    executing: bool,
    total_completed: u64,
}

impl PoolState {
    fn busy_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .count()
    }
}

/// Messages flowing from attempt tasks and backoff timers into the
/// scheduler loop.
enum PoolEvent {
    AttemptFinished {
        task_id: String,
        worker_id: String,
        attempt: u32,
        elapsed: Duration,
        outcome: anyhow::Result<AttemptOutcome>,
    },
    RetryElapsed {
        task_id: String,
    },
}

/// Resets the executing flag when a batch ends, on every exit path.
struct ExecGuard(Arc<Mutex<PoolState>>);

impl Drop for ExecGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.executing = false;
        }
    }
}

/// Bounded worker pool driving batches of test tasks to terminal results.
#[derive(Debug)]
pub struct WorkerManager {
    id: Uuid,
    state: Arc<Mutex<PoolState>>,
    retry_config: RetryConfig,
    /// Count of attempts currently executing, for shutdown draining.
    in_flight: Arc<watch::Sender<usize>>,
    last_flaky: Mutex<FlakyTestReport>,
}

impl WorkerManager {
    /// Create a pool with `min_workers` idle workers.
    ///
    /// Config is validated eagerly; no worker is created for a rejected
    /// config.
    pub fn new(config: WorkerManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let workers: Vec<Worker> = (0..config.min_workers).map(Worker::new).collect();
        let id = Uuid::new_v4();

        info!(
            manager = %id,
            workers = workers.len(),
            max_workers = config.max_workers,
            "worker pool ready"
        );

        Ok(Self {
            id,
            state: Arc::new(Mutex::new(PoolState {
                phase: Phase::Running,
                config,
                workers,
                pending: Vec::new(),
                executing: false,
                total_completed: 0,
            })),
            retry_config: RetryConfig::default(),
            in_flight: Arc::new(watch::Sender::new(0)),
            last_flaky: Mutex::new(FlakyTestReport::default()),
        })
    }

    /// Replace the default retry policy.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }

    /// Queue a task for the next [`execute_tasks`](Self::execute_tasks) call.
    ///
    /// Rejected once shutdown has begun, and for an id already pending.
    pub fn schedule_task(&self, task: TestTask) -> Result<(), ManagerError> {
        let mut state = self.lock_state();
        match state.phase {
            Phase::Running => {}
            Phase::ShuttingDown => return Err(ManagerError::ShuttingDown),
            Phase::Stopped => return Err(ManagerError::Stopped),
        }
        if state.pending.iter().any(|t| t.id == task.id) {
            return Err(BatchError::DuplicateTaskId(task.id).into());
        }

        debug!(manager = %self.id, task = %task.id, "task scheduled");
        state.pending.push(task);
        Ok(())
    }

    /// Run every scheduled task to a terminal result.
    ///
    /// Dispatch is priority-then-FIFO under the `max_workers` ceiling and
    /// the pool-wide serialization slot. Failed attempts are retried with
    /// exponential backoff up to each task's `max_retries`; backoff waits
    /// never occupy a worker. Returns one result per task in submission
    /// order.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InvalidBatch`] for duplicate ids, unknown
    ///   dependencies or dependency cycles; nothing runs.
    /// - [`ManagerError::ExecutorFault`] when the executor itself errors
    ///   (as opposed to reporting a failed attempt); the batch aborts with
    ///   no partial results.
    /// - [`ManagerError::ShuttingDown`] / [`ManagerError::Stopped`] when the
    ///   lifecycle no longer accepts work.
    pub async fn execute_tasks<E>(
        &self,
        executor: E,
    ) -> Result<Vec<TestExecutionResult>, ManagerError>
    where
        E: TaskExecutor + 'static,
    {
        let executor: Arc<dyn TaskExecutor> = Arc::new(executor);

        let batch = {
            let mut state = self.lock_state();
            match state.phase {
                Phase::Running => {}
                Phase::ShuttingDown => return Err(ManagerError::ShuttingDown),
                Phase::Stopped => return Err(ManagerError::Stopped),
            }
            if state.executing {
                return Err(ManagerError::BatchInProgress);
            }
            state.executing = true;
            std::mem::take(&mut state.pending)
        };
        let _guard = ExecGuard(Arc::clone(&self.state));

        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let batch_id = Uuid::new_v4();
        info!(manager = %self.id, batch = %batch_id, tasks = batch.len(), "executing batch");

        let mut queue = DispatchQueue::new(batch)?;
        let mut retries = RetryManager::new(self.retry_config.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolEvent>();

        let mut results: HashMap<String, TestExecutionResult> = HashMap::new();
        // Attempts and backoff timers this loop is still waiting on.
        let mut attempts_in_flight: usize = 0;
        let mut timers_pending: usize = 0;

        loop {
            attempts_in_flight += self.dispatch_ready(&mut queue, &retries, &executor, &tx);

            if queue.is_settled() {
                break;
            }

            if attempts_in_flight == 0 && timers_pending == 0 {
                // Nothing running, nothing timed, nothing dispatchable.
                let unresolved = queue.unsettled_ids().len();
                let phase = self.lock_state().phase;
                return Err(match phase {
                    Phase::Running => ManagerError::Stalled(unresolved),
                    Phase::ShuttingDown => ManagerError::ShuttingDown,
                    Phase::Stopped => ManagerError::Stopped,
                });
            }

            let Some(event) = rx.recv().await else {
                break;
            };

            match event {
                PoolEvent::AttemptFinished {
                    task_id,
                    worker_id,
                    attempt,
                    elapsed,
                    outcome,
                } => {
                    attempts_in_flight -= 1;

                    let outcome = match outcome {
                        Ok(outcome) => outcome,
                        Err(source) => {
                            warn!(
                                manager = %self.id,
                                task = %task_id,
                                "executor fault, aborting batch: {source}"
                            );
                            return Err(ManagerError::ExecutorFault { task_id, source });
                        }
                    };

                    retries.record_attempt(
                        &task_id,
                        AttemptRecord {
                            attempt,
                            success: outcome.success,
                            error: outcome.error.clone(),
                            worker_id: worker_id.clone(),
                            duration: elapsed,
                        },
                    );

                    let max_retries = queue.task(&task_id).map_or(0, |t| t.max_retries);
                    let attempts_used = retries.attempts(&task_id);
                    let terminal = outcome.success || attempts_used > max_retries;

                    if terminal {
                        queue.mark_finished(&task_id, true, outcome.success);

                        let is_flaky = retries.is_flaky(&task_id);
                        debug!(
                            manager = %self.id,
                            task = %task_id,
                            success = outcome.success,
                            flaky = is_flaky,
                            "task settled"
                        );
                        results.insert(
                            task_id.clone(),
                            TestExecutionResult {
                                task_id: task_id.clone(),
                                success: outcome.success,
                                error: outcome.error,
                                execution_time: elapsed,
                                worker_id: Some(worker_id),
                                retry_attempt: attempt,
                                is_flaky,
                                completed_at: chrono::Utc::now(),
                            },
                        );

                        let skip = self.lock_state().config.skip_dependents_on_failure;
                        if !outcome.success && skip {
                            for skipped in queue.skip_failed_dependents() {
                                debug!(
                                    manager = %self.id,
                                    task = %skipped.id,
                                    "skipped after upstream dependency failure"
                                );
                                results.insert(
                                    skipped.id.clone(),
                                    TestExecutionResult {
                                        task_id: skipped.id.clone(),
                                        success: false,
                                        error: Some(
                                            "skipped: an upstream dependency failed".to_string(),
                                        ),
                                        execution_time: Duration::ZERO,
                                        worker_id: None,
                                        retry_attempt: 0,
                                        is_flaky: false,
                                        completed_at: chrono::Utc::now(),
                                    },
                                );
                            }
                        }
                    } else {
                        queue.mark_finished(&task_id, false, false);

                        let backoff = retries.backoff(attempts_used);
                        debug!(
                            manager = %self.id,
                            task = %task_id,
                            attempt = backoff.attempt,
                            delay_ms = backoff.delay.as_millis() as u64,
                            "retrying after backoff"
                        );

                        timers_pending += 1;
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(backoff.delay).await;
                            let _ = tx.send(PoolEvent::RetryElapsed { task_id });
                        });
                    }
                }
                PoolEvent::RetryElapsed { task_id } => {
                    timers_pending -= 1;
                    queue.requeue(&task_id);
                }
            }
        }

        if let Ok(mut last) = self.last_flaky.lock() {
            *last = retries.flaky_report();
        }

        let stats = retries.stats();
        info!(
            manager = %self.id,
            batch = %batch_id,
            retries = stats.total_retries,
            flaky = stats.flaky_tasks,
            "batch settled"
        );

        let mut ordered = Vec::with_capacity(results.len());
        for id in queue.submission_order() {
            if let Some(result) = results.remove(id) {
                ordered.push(result);
            }
        }
        Ok(ordered)
    }

    /// Assign eligible tasks to idle workers; returns how many attempts
    /// were started.
    fn dispatch_ready(
        &self,
        queue: &mut DispatchQueue,
        retries: &RetryManager,
        executor: &Arc<dyn TaskExecutor>,
        tx: &mpsc::UnboundedSender<PoolEvent>,
    ) -> usize {
        let mut state = self.lock_state();
        if state.phase != Phase::Running {
            return 0;
        }

        let mut dispatched = 0;
        loop {
            if state.busy_count() >= state.config.max_workers {
                break;
            }
            let Some(slot) = state
                .workers
                .iter()
                .position(|w| w.state == WorkerState::Idle)
            else {
                break;
            };
            let Some(mut task) = queue.next_eligible() else {
                break;
            };

            task.retry_count = retries.attempts(&task.id);
            let attempt = task.retry_count;
            state.workers[slot].state = WorkerState::Busy;
            let worker_id = state.workers[slot].id.clone();
            self.in_flight.send_modify(|n| *n += 1);
            dispatched += 1;

            debug!(
                manager = %self.id,
                task = %task.id,
                worker = %worker_id,
                attempt,
                "dispatching attempt"
            );

            let task_id = task.id.clone();
            let executor = Arc::clone(executor);
            let tx = tx.clone();
            let pool = Arc::clone(&self.state);
            let in_flight = Arc::clone(&self.in_flight);
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = executor.execute(task).await;
                let elapsed = started.elapsed();

                {
                    let mut state = pool.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(worker) = state.workers.iter_mut().find(|w| w.id == worker_id) {
                        worker.state = WorkerState::Idle;
                        worker.completed_tasks += 1;
                    }
                    state.total_completed += 1;
                }
                in_flight.send_modify(|n| *n = n.saturating_sub(1));

                let _ = tx.send(PoolEvent::AttemptFinished {
                    task_id,
                    worker_id,
                    attempt,
                    elapsed,
                    outcome,
                });
            });
        }

        dispatched
    }

    /// Point-in-time snapshot of every worker.
    pub fn workers(&self) -> Vec<Worker> {
        self.lock_state().workers.clone()
    }

    /// Snapshot of one worker, `None` for unknown ids.
    pub fn worker(&self, id: &str) -> Option<Worker> {
        self.lock_state().workers.iter().find(|w| w.id == id).cloned()
    }

    /// Live pool statistics, recomputed from worker state.
    pub fn statistics(&self) -> PoolStatistics {
        let state = self.lock_state();
        let active = state.busy_count();
        PoolStatistics {
            total_workers: state.workers.len(),
            active_workers: active,
            idle_workers: state.workers.len() - active,
            total_tasks_completed: state.total_completed,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> WorkerManagerConfig {
        self.lock_state().config.clone()
    }

    /// Current retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Flaky-task report from the most recently settled batch.
    pub fn flaky_report(&self) -> FlakyTestReport {
        self.last_flaky
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Apply a partial config update atomically.
    ///
    /// The merged config is validated before any field is committed; a
    /// rejected update leaves the previous config and the pool untouched.
    /// Raising `min_workers` above the current pool size creates the
    /// missing workers immediately; lowering it never removes workers, and
    /// `max_workers` only moves the ceiling for future dispatches.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<(), ManagerError> {
        let mut state = self.lock_state();
        if state.phase == Phase::Stopped {
            return Err(ManagerError::Stopped);
        }

        let merged = update.merged_with(&state.config);
        merged.validate().map_err(ManagerError::Config)?;

        if merged.min_workers > state.workers.len() {
            let grow_to = merged.min_workers;
            info!(
                manager = %self.id,
                from = state.workers.len(),
                to = grow_to,
                "growing worker pool"
            );
            for index in state.workers.len()..grow_to {
                state.workers.push(Worker::new(index));
            }
        }

        state.config = merged;
        Ok(())
    }

    /// Sample process memory and attribute it across workers.
    ///
    /// Every worker's `memory_usage_mb` is a defined, non-negative number
    /// afterwards. Returns the total sampled, in MB. Advisory only: the
    /// engine never rejects tasks based on `memory_limit_mb`.
    pub fn monitor_memory_usage(&self) -> f64 {
        let total = monitor::sample_rss_mb();
        let mut state = self.lock_state();
        let share = monitor::per_worker_share(total, state.workers.len());
        for worker in &mut state.workers {
            worker.memory_usage_mb = share;
        }
        total
    }

    /// Drain in-flight work and stop the pool.
    ///
    /// Scheduling is rejected as soon as this is called. Waits for running
    /// attempts to finish, up to `timeout` (indefinitely when `None`), then
    /// clears the worker list. A timeout stops the *waiting*; it does not
    /// interrupt a running executor invocation. Idempotent once stopped.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        {
            let mut state = self.lock_state();
            if state.phase == Phase::Stopped {
                return;
            }
            state.phase = Phase::ShuttingDown;
        }
        info!(manager = %self.id, "shutting down, draining in-flight attempts");

        let mut rx = self.in_flight.subscribe();
        let drained = async move {
            let _ = rx.wait_for(|count| *count == 0).await;
        };

        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, drained).await.is_err() {
                    warn!(
                        manager = %self.id,
                        in_flight = *self.in_flight.borrow(),
                        "shutdown timed out with attempts still in flight"
                    );
                }
            }
            None => drained.await,
        }

        let mut state = self.lock_state();
        state.phase = Phase::Stopped;
        state.workers.clear();
        info!(manager = %self.id, "worker pool stopped");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> WorkerManagerConfig {
        WorkerManagerConfig {
            max_workers: 4,
            min_workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_pool_size_matches_min_workers() {
        let manager = WorkerManager::new(small_config()).unwrap();
        let workers = manager.workers();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.state == WorkerState::Idle));
        assert!(workers.iter().all(|w| w.completed_tasks == 0));
    }

    #[test]
    fn test_invalid_config_creates_nothing() {
        let err = WorkerManager::new(WorkerManagerConfig {
            max_workers: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::MaxWorkersTooLow(0)));
    }

    #[test]
    fn test_worker_lookup() {
        let manager = WorkerManager::new(small_config()).unwrap();
        assert!(manager.worker("worker-0").is_some());
        assert!(manager.worker("worker-1").is_some());
        assert!(manager.worker("worker-99").is_none());
    }

    #[test]
    fn test_duplicate_pending_task_rejected() {
        let manager = WorkerManager::new(small_config()).unwrap();
        manager.schedule_task(TestTask::new("t1", "x")).unwrap();
        let err = manager.schedule_task(TestTask::new("t1", "y")).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::InvalidBatch(BatchError::DuplicateTaskId(_))
        ));
    }

    #[test]
    fn test_statistics_are_live() {
        let manager = WorkerManager::new(small_config()).unwrap();
        let stats = manager.statistics();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.idle_workers, 2);
        assert_eq!(stats.total_tasks_completed, 0);
    }

    #[test]
    fn test_update_config_grows_pool() {
        let manager = WorkerManager::new(small_config()).unwrap();
        manager
            .update_config(ConfigUpdate {
                min_workers: Some(4),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(manager.workers().len(), 4);
        assert_eq!(manager.config().min_workers, 4);

        // Shrinking min_workers keeps existing workers.
        manager
            .update_config(ConfigUpdate {
                min_workers: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(manager.workers().len(), 4);
    }

    #[test]
    fn test_rejected_update_leaves_config_unchanged() {
        let manager = WorkerManager::new(small_config()).unwrap();
        let before = manager.config();

        let err = manager
            .update_config(ConfigUpdate {
                min_workers: Some(10),
                ..Default::default()
            })
            .unwrap_err();

        assert!(matches!(
            err,
            ManagerError::Config(ConfigError::MinExceedsMax { min: 10, max: 4 })
        ));
        assert_eq!(manager.config(), before);
        assert_eq!(manager.workers().len(), 2);
    }

    #[test]
    fn test_memory_attribution_defined_for_all_workers() {
        let manager = WorkerManager::new(small_config()).unwrap();
        let total = manager.monitor_memory_usage();
        assert!(total >= 0.0);
        for worker in manager.workers() {
            assert!(worker.memory_usage_mb >= 0.0);
        }
    }

    #[tokio::test]
    async fn test_schedule_rejected_after_shutdown() {
        let manager = WorkerManager::new(small_config()).unwrap();
        manager.shutdown(Some(Duration::from_millis(100))).await;

        let err = manager.schedule_task(TestTask::new("late", "x")).unwrap_err();
        assert!(matches!(err, ManagerError::Stopped));
        assert!(manager.workers().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = WorkerManager::new(small_config()).unwrap();
        manager.shutdown(None).await;
        manager.shutdown(None).await;
        assert!(manager.workers().is_empty());
    }
}
