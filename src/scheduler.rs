//! Dispatch ordering for one batch of tasks.
//!
//! The [`DispatchQueue`] owns the ready-set bookkeeping for a batch: it
//! tracks which tasks have terminal results, recomputes eligibility whenever
//! a task finishes, and hands out the next task to run under three
//! simultaneous constraints:
//!
//! 1. **Dependencies** — a task is eligible only once every dependency has a
//!    terminal result (success or failure).
//! 2. **Priority** — among eligible tasks, higher priority dispatches first;
//!    ties preserve submission order.
//! 3. **Serialization** — at most one task flagged `requires_serialization`
//!    may be running at any instant; other tasks are unaffected.
//!
//! Eligibility is checked per task rather than via a global topological
//! pass, so an unrelated stuck subgraph never blocks independent tasks.
//! Batches with duplicate ids, dependencies on tasks outside the batch, or
//! dependency cycles are rejected at construction.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::task::TestTask;

/// Errors detected while validating a batch.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("duplicate task id in batch: {0}")]
    DuplicateTaskId(String),

    #[error("task `{task}` depends on `{dependency}`, which is not in the batch")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle involving task `{0}`")]
    DependencyCycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskPhase {
    /// Waiting to become eligible.
    Pending,
    /// An attempt is in flight.
    Running,
    /// Failed attempt recorded; parked until its backoff elapses.
    WaitingRetry,
    /// Terminal.
    Done { success: bool },
}

#[derive(Debug)]
struct Entry {
    task: TestTask,
    seq: usize,
    phase: TaskPhase,
}

/// Ready-set and dispatch-order bookkeeping for one batch.
#[derive(Debug)]
pub struct DispatchQueue {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    serial_active: Option<String>,
}

impl DispatchQueue {
    /// Build a queue from a batch, validating it first.
    ///
    /// Rejects duplicate ids, dependencies on ids outside the batch, and
    /// dependency cycles. A rejected batch runs nothing.
    pub fn new(batch: Vec<TestTask>) -> Result<Self, BatchError> {
        let mut entries = HashMap::with_capacity(batch.len());
        let mut order = Vec::with_capacity(batch.len());

        for (seq, task) in batch.into_iter().enumerate() {
            let id = task.id.clone();
            if entries.contains_key(&id) {
                return Err(BatchError::DuplicateTaskId(id));
            }
            order.push(id.clone());
            entries.insert(
                id,
                Entry {
                    task,
                    seq,
                    phase: TaskPhase::Pending,
                },
            );
        }

        for id in &order {
            for dep in &entries[id].task.dependencies {
                if !entries.contains_key(dep) {
                    return Err(BatchError::UnknownDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(id) = detect_cycle(&entries, &order) {
            return Err(BatchError::DependencyCycle(id));
        }

        Ok(Self {
            entries,
            order,
            serial_active: None,
        })
    }

    /// Number of tasks in the batch.
    pub fn total(&self) -> usize {
        self.order.len()
    }

    /// True once every task has a terminal result.
    pub fn is_settled(&self) -> bool {
        self.entries
            .values()
            .all(|e| matches!(e.phase, TaskPhase::Done { .. }))
    }

    fn deps_terminal(&self, entry: &Entry) -> bool {
        entry.task.dependencies.iter().all(|dep| {
            matches!(
                self.entries.get(dep).map(|e| e.phase),
                Some(TaskPhase::Done { .. })
            )
        })
    }

    /// Pick the next task to dispatch and mark it running.
    ///
    /// Returns `None` when nothing is currently eligible (all blocked,
    /// running, parked for retry, or done).
    pub fn next_eligible(&mut self) -> Option<TestTask> {
        let serial_busy = self.serial_active.is_some();

        let best = self
            .entries
            .values()
            .filter(|e| e.phase == TaskPhase::Pending)
            .filter(|e| !(e.task.requires_serialization && serial_busy))
            .filter(|e| self.deps_terminal(e))
            .min_by_key(|e| (Reverse(e.task.priority), e.seq))
            .map(|e| e.task.id.clone())?;

        let entry = self.entries.get_mut(&best)?;
        entry.phase = TaskPhase::Running;
        if entry.task.requires_serialization {
            self.serial_active = Some(best);
        }
        Some(entry.task.clone())
    }

    /// Record the end of an attempt for a running task.
    ///
    /// Frees the serialization slot if this task held it. With
    /// `terminal == true` the task reaches its final state; otherwise it is
    /// parked until [`requeue`](Self::requeue) re-enters it after backoff.
    pub fn mark_finished(&mut self, id: &str, terminal: bool, success: bool) {
        if self.serial_active.as_deref() == Some(id) {
            self.serial_active = None;
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.phase = if terminal {
                TaskPhase::Done { success }
            } else {
                TaskPhase::WaitingRetry
            };
        }
    }

    /// Re-enter a retry-parked task into the ready set.
    pub fn requeue(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.phase == TaskPhase::WaitingRetry {
                entry.phase = TaskPhase::Pending;
            }
        }
    }

    /// Resolve every pending task that (transitively) depends on a failed
    /// task as failed-without-running.
    ///
    /// Used when the skip-dependents policy is enabled. Returns the skipped
    /// tasks so the caller can emit synthetic results for them. The cascade
    /// is iterated to a fixpoint: skipping a task can unblock-skip its own
    /// dependents.
    pub fn skip_failed_dependents(&mut self) -> Vec<TestTask> {
        let mut skipped = Vec::new();

        loop {
            let next: Vec<String> = self
                .entries
                .values()
                .filter(|e| e.phase == TaskPhase::Pending)
                .filter(|e| {
                    e.task.dependencies.iter().any(|dep| {
                        matches!(
                            self.entries.get(dep).map(|d| d.phase),
                            Some(TaskPhase::Done { success: false })
                        )
                    })
                })
                .map(|e| e.task.id.clone())
                .collect();

            if next.is_empty() {
                break;
            }

            for id in next {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.phase = TaskPhase::Done { success: false };
                    skipped.push(entry.task.clone());
                }
            }
        }

        skipped
    }

    /// Look up a task in the batch.
    pub fn task(&self, id: &str) -> Option<&TestTask> {
        self.entries.get(id).map(|e| &e.task)
    }

    /// Ids of tasks without a terminal result, in submission order.
    pub fn unsettled_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !matches!(self.entries[*id].phase, TaskPhase::Done { .. }))
            .cloned()
            .collect()
    }

    /// Tasks in submission order.
    pub fn submission_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

/// Three-color DFS over dependency edges; returns a task on a cycle.
fn detect_cycle(entries: &HashMap<String, Entry>, order: &[String]) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: HashMap<&str, Color> =
        order.iter().map(|id| (id.as_str(), Color::White)).collect();

    for root in order {
        if colors[root.as_str()] != Color::White {
            continue;
        }

        // Explicit stack of (node, next dependency index).
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        colors.insert(root.as_str(), Color::Gray);

        while let Some((node, dep_idx)) = stack.last().copied() {
            let deps = &entries[node].task.dependencies;
            if dep_idx < deps.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let dep = deps[dep_idx].as_str();
                match colors[dep] {
                    Color::Gray => return Some(dep.to_string()),
                    Color::White => {
                        colors.insert(dep, Color::Gray);
                        stack.push((dep, 0));
                    }
                    Color::Black => {}
                }
            } else {
                colors.insert(node, Color::Black);
                stack.pop();
            }
        }
    }

    None
}
