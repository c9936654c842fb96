//! Retry and flakiness detection logic.
//!
//! The [`RetryManager`] records every attempt a task makes, decides whether
//! a failed task gets another attempt, computes the backoff delay before
//! that attempt, and classifies tasks as flaky when their attempts disagree.
//! Backoff shape and the disagreement threshold come from
//! [`RetryConfig`](crate::config::RetryConfig) rather than hard-coded
//! constants.
//!
//! Only reported failures (`AttemptOutcome { success: false, .. }`) are
//! retried. An executor call that errors outright is a fault in the runner,
//! not a test outcome, and is propagated without retry.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::config::RetryConfig;
use crate::task::TestTask;

/// One recorded attempt for a task.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// Attempt index (0 = first run).
    pub attempt: u32,
    /// Whether the attempt passed.
    pub success: bool,
    /// Failure message, if any.
    pub error: Option<String>,
    /// Worker that ran the attempt.
    pub worker_id: String,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
}

/// Computed backoff before a retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// Index of the attempt the delay precedes.
    pub attempt: u32,
    /// How long to wait before dispatching it.
    pub delay: Duration,
}

/// A task whose attempts disagreed, with its full history.
#[derive(Debug, Clone, Serialize)]
pub struct FlakyTaskRecord {
    /// Id of the flaky task.
    pub task_id: String,
    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Polarity of the final attempt.
    pub final_success: bool,
}

/// Aggregated report of flaky tasks across a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlakyTestReport {
    pub tasks: Vec<FlakyTaskRecord>,
}

impl FlakyTestReport {
    /// True when no task was classified flaky.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Statistics about retry activity in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    /// Unique tasks that ran at least one attempt.
    pub total_tasks: usize,
    /// Attempts beyond each task's first.
    pub total_retries: usize,
    /// Tasks classified flaky.
    pub flaky_tasks: usize,
}

/// Tracks attempts, computes backoff and classifies flakiness.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    attempts: HashMap<String, Vec<AttemptRecord>>,
}

impl RetryManager {
    /// Create a manager with the given retry policy.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: HashMap::new(),
        }
    }

    /// Record one finished attempt.
    pub fn record_attempt(&mut self, task_id: &str, record: AttemptRecord) {
        self.attempts
            .entry(task_id.to_string())
            .or_default()
            .push(record);
    }

    /// Number of attempts recorded for a task.
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts.get(task_id).map_or(0, |a| a.len() as u32)
    }

    /// Whether a failed task has retries left.
    ///
    /// A task gets `max_retries` attempts beyond its first, so retries stop
    /// once `max_retries + 1` attempts are recorded.
    pub fn should_retry(&self, task: &TestTask) -> bool {
        self.attempts(&task.id) < task.max_retries + 1
    }

    /// Backoff delay before the given attempt index.
    ///
    /// Exponential in the number of failed attempts so far, capped at
    /// `max_delay_ms`: `min(base * multiplier^(attempt - 1), cap)`.
    pub fn backoff(&self, attempt: u32) -> BackoffResult {
        let failed_attempts = attempt.saturating_sub(1);
        let raw = self.config.base_delay_ms as f64
            * self.config.multiplier.powi(failed_attempts as i32);
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);

        BackoffResult {
            attempt,
            delay: Duration::from_millis(capped as u64),
        }
    }

    /// Whether a task's attempts disagree enough to call it flaky.
    ///
    /// The number of disagreements is the smaller of the pass and fail
    /// counts; the task is flaky once that reaches the configured threshold,
    /// regardless of the final attempt's polarity.
    pub fn is_flaky(&self, task_id: &str) -> bool {
        let Some(records) = self.attempts.get(task_id) else {
            return false;
        };
        let successes = records.iter().filter(|r| r.success).count() as u32;
        let failures = records.len() as u32 - successes;
        successes.min(failures) >= self.config.flaky_disagreement_threshold
    }

    /// Full attempt history for a task.
    pub fn history(&self, task_id: &str) -> &[AttemptRecord] {
        self.attempts.get(task_id).map_or(&[], Vec::as_slice)
    }

    /// Aggregate all flaky tasks into a report.
    pub fn flaky_report(&self) -> FlakyTestReport {
        let mut tasks: Vec<FlakyTaskRecord> = self
            .attempts
            .iter()
            .filter(|(id, _)| self.is_flaky(id))
            .map(|(id, records)| FlakyTaskRecord {
                task_id: id.clone(),
                attempts: records.clone(),
                final_success: records.last().is_some_and(|r| r.success),
            })
            .collect();

        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        FlakyTestReport { tasks }
    }

    /// Retry statistics across all recorded tasks.
    pub fn stats(&self) -> RetryStats {
        let total_tasks = self.attempts.len();
        let total_retries = self
            .attempts
            .values()
            .map(|a| a.len().saturating_sub(1))
            .sum();
        let flaky_tasks = self
            .attempts
            .keys()
            .filter(|id| self.is_flaky(id))
            .count();

        RetryStats {
            total_tasks,
            total_retries,
            flaky_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(attempt: u32, success: bool) -> AttemptRecord {
        AttemptRecord {
            attempt,
            success,
            error: (!success).then(|| "assertion failed".to_string()),
            worker_id: "worker-0".to_string(),
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_should_retry_bounded_by_max_retries() {
        let mut manager = RetryManager::new(RetryConfig::default());
        let task = TestTask::new("t1", "x").max_retries(2);

        assert!(manager.should_retry(&task));
        manager.record_attempt("t1", record(0, false));
        assert!(manager.should_retry(&task));
        manager.record_attempt("t1", record(1, false));
        assert!(manager.should_retry(&task));
        manager.record_attempt("t1", record(2, false));
        assert!(!manager.should_retry(&task));
    }

    #[test]
    fn test_no_retries_when_max_retries_zero() {
        let mut manager = RetryManager::new(RetryConfig::default());
        let task = TestTask::new("t1", "x");

        manager.record_attempt("t1", record(0, false));
        assert!(!manager.should_retry(&task));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let manager = RetryManager::new(RetryConfig {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 350,
            flaky_disagreement_threshold: 1,
        });

        assert_eq!(manager.backoff(1).delay, Duration::from_millis(100));
        assert_eq!(manager.backoff(2).delay, Duration::from_millis(200));
        // 100 * 2^2 = 400, capped at 350.
        assert_eq!(manager.backoff(3).delay, Duration::from_millis(350));
        assert_eq!(manager.backoff(3).attempt, 3);
    }

    #[test]
    fn test_flaky_when_attempts_disagree() {
        let mut manager = RetryManager::new(RetryConfig::default());

        manager.record_attempt("t1", record(0, false));
        manager.record_attempt("t1", record(1, true));

        assert!(manager.is_flaky("t1"));
    }

    #[test]
    fn test_flaky_regardless_of_final_polarity() {
        let mut manager = RetryManager::new(RetryConfig::default());

        manager.record_attempt("t1", record(0, true));
        manager.record_attempt("t1", record(1, false));

        assert!(manager.is_flaky("t1"));
    }

    #[test]
    fn test_not_flaky_when_consistent() {
        let mut manager = RetryManager::new(RetryConfig::default());

        manager.record_attempt("pass", record(0, true));
        manager.record_attempt("pass", record(1, true));
        manager.record_attempt("fail", record(0, false));
        manager.record_attempt("fail", record(1, false));

        assert!(!manager.is_flaky("pass"));
        assert!(!manager.is_flaky("fail"));
        assert!(!manager.is_flaky("never-ran"));
    }

    #[test]
    fn test_disagreement_threshold_respected() {
        let mut manager = RetryManager::new(RetryConfig {
            flaky_disagreement_threshold: 2,
            ..Default::default()
        });

        manager.record_attempt("t1", record(0, false));
        manager.record_attempt("t1", record(1, true));
        assert!(!manager.is_flaky("t1"));

        manager.record_attempt("t1", record(2, false));
        manager.record_attempt("t1", record(3, true));
        assert!(manager.is_flaky("t1"));
    }

    #[test]
    fn test_flaky_report_contents() {
        let mut manager = RetryManager::new(RetryConfig::default());

        manager.record_attempt("flaky", record(0, false));
        manager.record_attempt("flaky", record(1, true));
        manager.record_attempt("steady", record(0, true));

        let report = manager.flaky_report();
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].task_id, "flaky");
        assert_eq!(report.tasks[0].attempts.len(), 2);
        assert!(report.tasks[0].final_success);

        // Reports serialize for downstream consumers.
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"task_id\":\"flaky\""));
    }

    #[test]
    fn test_stats() {
        let mut manager = RetryManager::new(RetryConfig::default());

        manager.record_attempt("a", record(0, false));
        manager.record_attempt("a", record(1, true));
        manager.record_attempt("b", record(0, true));

        let stats = manager.stats();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.flaky_tasks, 1);
    }
}
