//! stampede: a dependency-aware bounded worker pool for test tasks.
//!
//! This crate schedules large batches of independent, interdependent and
//! flakiness-prone test tasks across a bounded set of logical workers. It
//! knows nothing about any test framework: callers hand it opaque
//! [`TestTask`] descriptors and a [`TaskExecutor`] callback, and get back
//! one [`TestExecutionResult`] per task.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Scheduler** ([`scheduler`]): dependency resolution, priority/FIFO
//!   ordering and the pool-wide serialization lane
//! - **Worker pool** ([`manager`]): bounded dispatch, lifecycle and shutdown
//!   draining
//! - **Retry** ([`retry`]): exponential backoff and flaky-task detection
//! - **Monitor** ([`monitor`]): advisory per-worker memory attribution
//! - **Config** ([`config`]): validated, partially-updatable configuration
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
//!     manager.schedule_task(TestTask::new("db::migrate", "tests/test_db.py"))?;
//!     manager.schedule_task(
//!         TestTask::new("auth::login", "tests/test_auth.py")
//!             .depends_on("db::migrate")
//!             .max_retries(2),
//!     )?;
//!
//!     let results = manager
//!         .execute_tasks(|task: TestTask| async move {
//!             // run the test behind `task.file_path` and report its outcome
//!             Ok(AttemptOutcome::passed())
//!         })
//!         .await?;
//!
//!     for result in &results {
//!         println!("{}: success={} flaky={}", result.task_id, result.success, result.is_flaky);
//!     }
//!
//!     manager.shutdown(None).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod manager;
pub mod monitor;
pub mod retry;
pub mod scheduler;
pub mod task;

// Re-export commonly used types
pub use config::{load_config, load_config_str, Config, ConfigError, ConfigUpdate, RetryConfig, WorkerManagerConfig};
pub use manager::{ManagerError, WorkerManager};
pub use retry::{AttemptRecord, BackoffResult, FlakyTestReport, RetryManager, RetryStats};
pub use scheduler::{BatchError, DispatchQueue};
pub use task::{
    AttemptOutcome, PoolStatistics, TaskExecutor, TestExecutionResult, TestTask, Worker,
    WorkerState,
};
