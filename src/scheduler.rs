//! Selects the next runnable task per strategy, honors dependencies, and
//! drives the supervisor (spec.md §4.7), grounded on the original `Scheduler`
//! and strategy hierarchy
//! (`examples/original_source/src/fuzzflow/core/scheduler.py`).

use std::collections::{HashMap, VecDeque};

use crate::constraints::CurrentUsage;
use crate::task::{Task, TaskId, TaskPriority, TaskStatus};

const COMPLETED_HISTORY_CAP: usize = 1000;
const COMPLETED_HISTORY_COMPACT_TO: usize = 500;
const PREEMPTION_PRIORITY_GAP: i32 = 25;

/// Budget handed to a strategy at election time (spec.md §4.7 step 3).
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub available_mb: u64,
    pub available_cores: u32,
}

/// A pluggable election policy (spec.md §4.7).
pub trait SchedulingStrategy: Send {
    /// Returns the index into `ready` of the task to run next, or `None`.
    fn select_next<'a>(&mut self, ready: &'a [&'a Task], budget: Budget) -> Option<usize>;

    /// Whether `running` should be preempted to make room for `pending`.
    fn should_preempt(&self, running: &Task, pending: &Task) -> bool;

    /// Called once a task completes, so strategies that track consumption
    /// (fair-share) can update their accounting.
    fn record_runtime(&mut self, _task: &Task, _runtime_seconds: f64) {}
}

/// Sort ready tasks by `(-priority, created_at)`; return the first that fits.
/// Optional preemption when enabled and the gap is >= 25 (off by default).
pub struct PriorityStrategy {
    pub enable_preemption: bool,
}

impl PriorityStrategy {
    pub fn new(enable_preemption: bool) -> Self {
        Self { enable_preemption }
    }
}

impl SchedulingStrategy for PriorityStrategy {
    fn select_next<'a>(&mut self, ready: &'a [&'a Task], budget: Budget) -> Option<usize> {
        let mut order: Vec<usize> = (0..ready.len()).collect();
        order.sort_by(|&a, &b| {
            ready[b]
                .priority
                .cmp(&ready[a].priority)
                .then_with(|| ready[a].lifecycle.created_at.cmp(&ready[b].lifecycle.created_at))
        });
        order
            .into_iter()
            .find(|&i| ready[i].can_fit_resources(budget.available_mb, budget.available_cores))
    }

    fn should_preempt(&self, running: &Task, pending: &Task) -> bool {
        if !self.enable_preemption {
            return false;
        }
        pending.priority.value() - running.priority.value() >= PREEMPTION_PRIORITY_GAP
    }
}

/// Normalized tag shares; at election, each fitting task is scored by
/// `min over its tags of (current_share / target_share)`. No preemption.
pub struct FairShareStrategy {
    shares: HashMap<String, f64>,
    tag_runtime: HashMap<String, f64>,
}

impl FairShareStrategy {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        let total: f64 = weights.values().sum();
        let shares = if total > 0.0 {
            weights.into_iter().map(|(k, v)| (k, v / total)).collect()
        } else {
            HashMap::new()
        };
        Self {
            shares,
            tag_runtime: HashMap::new(),
        }
    }

    fn usage_ratio(&self, tag: &str) -> f64 {
        let Some(&target_share) = self.shares.get(tag) else {
            return f64::INFINITY;
        };
        if target_share <= 0.0 {
            return f64::INFINITY;
        }
        let total_usage: f64 = self.tag_runtime.values().sum();
        let current_usage = self.tag_runtime.get(tag).copied().unwrap_or(0.0);
        let current_share = if total_usage > 0.0 {
            current_usage / total_usage
        } else {
            0.0
        };
        current_share / target_share
    }
}

impl SchedulingStrategy for FairShareStrategy {
    fn select_next<'a>(&mut self, ready: &'a [&'a Task], budget: Budget) -> Option<usize> {
        ready
            .iter()
            .enumerate()
            .filter(|(_, t)| t.can_fit_resources(budget.available_mb, budget.available_cores))
            .map(|(i, t)| {
                let min_ratio = t
                    .tags
                    .iter()
                    .map(|tag| self.usage_ratio(tag))
                    .fold(f64::INFINITY, f64::min);
                (i, min_ratio, t.lifecycle.created_at)
            })
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.2.cmp(&b.2))
            })
            .map(|(i, _, _)| i)
    }

    fn should_preempt(&self, _running: &Task, _pending: &Task) -> bool {
        false
    }

    fn record_runtime(&mut self, task: &Task, runtime_seconds: f64) {
        for tag in &task.tags {
            *self.tag_runtime.entry(tag.clone()).or_insert(0.0) += runtime_seconds;
        }
    }
}

/// Tracks the pending/running/completed task collections and drives election;
/// does not itself own process handles (that's [`crate::process::ProcessSupervisor`],
/// spec.md §3 ownership rules).
pub struct Scheduler {
    pending: Vec<Task>,
    running: HashMap<TaskId, Task>,
    completed: VecDeque<Task>,
    strategy: Box<dyn SchedulingStrategy>,
    pub max_concurrent: usize,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit_percent: Option<f64>,
    tasks_scheduled: u64,
    tasks_completed: u64,
    tasks_failed: u64,
}

impl Scheduler {
    pub fn new(strategy: Box<dyn SchedulingStrategy>, max_concurrent: usize) -> Self {
        Self {
            pending: Vec::new(),
            running: HashMap::new(),
            completed: VecDeque::new(),
            strategy,
            max_concurrent,
            memory_limit_mb: None,
            cpu_limit_percent: None,
            tasks_scheduled: 0,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    pub fn submit(&mut self, task: Task) {
        log::info!("submitted task {} with priority {:?}", task.name, task.priority);
        self.pending.push(task);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.running.is_empty()
    }

    pub fn running(&self) -> impl Iterator<Item = &Task> {
        self.running.values()
    }

    pub fn running_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.running.get_mut(&id)
    }

    /// Dependencies are satisfied when every declared predecessor has reached
    /// a terminal status. Dependencies never expire (spec.md §4.7).
    fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.completed
                .iter()
                .any(|t| t.id == *dep && t.status.is_terminal())
        })
    }

    fn ready_indices(&self) -> Vec<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending && self.dependencies_satisfied(t))
            .map(|(i, _)| i)
            .collect()
    }

    /// Step 1 of the cycle (spec.md §4.7): reclassify reaped handles as
    /// COMPLETED/FAILED, fire callbacks, and unblock dependents. The caller
    /// supplies exit status for tasks whose handle the supervisor has reaped.
    pub fn reap(&mut self, exited: &[(TaskId, i32)], mut on_complete: impl FnMut(&Task), mut on_fail: impl FnMut(&Task)) {
        for &(task_id, exit_code) in exited {
            let Some(mut task) = self.running.remove(&task_id) else {
                continue;
            };
            let runtime = task.duration().map(|d| d.as_secs_f64()).unwrap_or(0.0);
            if exit_code == 0 {
                task.update_status(TaskStatus::Completed);
                self.tasks_completed += 1;
                on_complete(&task);
            } else {
                task.update_status(TaskStatus::Failed);
                self.tasks_failed += 1;
                on_fail(&task);
            }
            self.strategy.record_runtime(&task, runtime);
            self.push_completed(task);
        }
    }

    fn push_completed(&mut self, task: Task) {
        self.completed.push_back(task);
        if self.completed.len() > COMPLETED_HISTORY_CAP {
            let excess = self.completed.len() - COMPLETED_HISTORY_COMPACT_TO;
            for _ in 0..excess {
                self.completed.pop_front();
            }
        }
    }

    /// Step 3 of the cycle (spec.md §4.7): repeatedly ask the strategy for the
    /// next candidate and attempt to admit it via `try_spawn`, until
    /// `max_concurrent` is reached or nothing fits. `try_spawn` returns `true`
    /// on a successful spawn (the caller owns the supervisor/constraint calls).
    pub fn elect(&mut self, mut budget: Budget, mut try_spawn: impl FnMut(&Task, Budget) -> bool) {
        loop {
            if self.running.len() >= self.max_concurrent {
                break;
            }
            let ready_idx = self.ready_indices();
            if ready_idx.is_empty() {
                break;
            }
            let ready_tasks: Vec<&Task> = ready_idx.iter().map(|&i| &self.pending[i]).collect();
            let Some(selected) = self.strategy.select_next(&ready_tasks, budget) else {
                break;
            };
            let pending_idx = ready_idx[selected];
            let candidate_mem = self.pending[pending_idx].resources.memory_limit_mb.unwrap_or(0);
            let candidate_cores = self.pending[pending_idx].resources.cpu_cores.unwrap_or(0);

            if !try_spawn(&self.pending[pending_idx], budget) {
                break;
            }

            let mut task = self.pending.remove(pending_idx);
            task.update_status(TaskStatus::Running);
            self.tasks_scheduled += 1;
            budget.available_mb = budget.available_mb.saturating_sub(candidate_mem);
            budget.available_cores = budget.available_cores.saturating_sub(candidate_cores);
            self.running.insert(task.id, task);
        }
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            pending: self.pending.len(),
            running: self.running.len(),
            completed: self.completed.len(),
            tasks_scheduled: self.tasks_scheduled,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStatistics {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl From<CurrentUsage> for Budget {
    fn from(usage: CurrentUsage) -> Self {
        Budget {
            available_mb: usage.memory_mb,
            available_cores: usage.cpu_percent as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;

    #[test]
    fn priority_strategy_prefers_higher_priority() {
        let mut strategy = PriorityStrategy::new(false);
        let low = TaskBuilder::new("low", "afl").priority(TaskPriority::Low).build();
        let high = TaskBuilder::new("high", "afl").priority(TaskPriority::High).build();
        let ready = vec![&low, &high];
        let budget = Budget {
            available_mb: 1024,
            available_cores: 4,
        };
        let idx = strategy.select_next(&ready, budget).unwrap();
        assert_eq!(ready[idx].name, "high");
    }

    #[test]
    fn priority_strategy_skips_tasks_that_do_not_fit() {
        let mut strategy = PriorityStrategy::new(false);
        let big = TaskBuilder::new("big", "afl").memory_limit_mb(4096).build();
        let small = TaskBuilder::new("small", "afl").memory_limit_mb(128).build();
        let ready = vec![&big, &small];
        let budget = Budget {
            available_mb: 256,
            available_cores: 4,
        };
        let idx = strategy.select_next(&ready, budget).unwrap();
        assert_eq!(ready[idx].name, "small");
    }

    #[test]
    fn preemption_requires_enable_and_gap() {
        let strategy = PriorityStrategy::new(true);
        let running = TaskBuilder::new("r", "afl").priority(TaskPriority::Low).build();
        let pending = TaskBuilder::new("p", "afl").priority(TaskPriority::Critical).build();
        assert!(strategy.should_preempt(&running, &pending));

        let strategy_off = PriorityStrategy::new(false);
        assert!(!strategy_off.should_preempt(&running, &pending));
    }

    #[test]
    fn scheduler_submits_and_reports_pending() {
        let mut scheduler = Scheduler::new(Box::new(PriorityStrategy::new(false)), 4);
        scheduler.submit(TaskBuilder::new("t1", "afl").build());
        assert_eq!(scheduler.pending_count(), 1);
        assert!(scheduler.has_pending());
    }

    #[test]
    fn dependencies_block_readiness() {
        let mut scheduler = Scheduler::new(Box::new(PriorityStrategy::new(false)), 4);
        let dep_id = TaskId::new();
        let mut task = TaskBuilder::new("t1", "afl").build();
        task.dependencies.insert(dep_id);
        scheduler.submit(task);
        assert!(scheduler.ready_indices().is_empty());
    }

    #[test]
    fn dependent_becomes_ready_once_predecessor_completes() {
        let mut scheduler = Scheduler::new(Box::new(PriorityStrategy::new(false)), 4);
        let dep_task = TaskBuilder::new("dep", "afl").build();
        let dep_id = dep_task.id;
        let mut dependent = TaskBuilder::new("t1", "afl").build();
        dependent.dependencies.insert(dep_id);
        scheduler.submit(dependent);
        assert!(scheduler.ready_indices().is_empty());

        scheduler.running.insert(dep_id, dep_task);
        scheduler.reap(&[(dep_id, 0)], |_| {}, |_| {});

        assert_eq!(scheduler.ready_indices().len(), 1);
    }
}
