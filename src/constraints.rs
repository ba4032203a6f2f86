//! Composable admission + runtime resource predicates (spec.md §4.6), grounded
//! on the original `ResourceConstraint` hierarchy
//! (`examples/original_source/src/fuzzflow/monitoring/constraints.py`).

use std::collections::HashMap;

use crate::process::{ProcessHandle, ProcessState};
use crate::task::{Task, TaskId};

/// Current resource usage visible to admission checks (spec.md §4.7 "compute
/// budget" step).
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentUsage {
    pub memory_mb: u64,
    pub cpu_percent: f64,
}

/// A single composable predicate over admission and runtime (spec.md §4.6).
pub trait Constraint: Send + Sync {
    /// Precondition for spawning.
    fn can_admit(&self, task: &Task, current: CurrentUsage) -> bool;

    /// Runtime check against a live handle.
    fn is_violating(&self, handle: &ProcessHandle) -> bool;

    /// Human-readable violation reason.
    fn message(&self, handle: &ProcessHandle) -> String;
}

/// Global cap + optional per-handle cap on process-tree RSS.
pub struct MemoryConstraint {
    pub max_total_mb: u64,
    pub per_process_limit_mb: Option<u64>,
}

impl Constraint for MemoryConstraint {
    fn can_admit(&self, task: &Task, current: CurrentUsage) -> bool {
        let required = task.resources.memory_limit_mb.unwrap_or(512);
        current.memory_mb + required <= self.max_total_mb
    }

    fn is_violating(&self, handle: &ProcessHandle) -> bool {
        let Some(limit) = self.per_process_limit_mb else {
            return false;
        };
        handle
            .latest_metric()
            .map(|m| m.memory_mb > limit)
            .unwrap_or(false)
    }

    fn message(&self, handle: &ProcessHandle) -> String {
        let memory_mb = handle.latest_metric().map(|m| m.memory_mb).unwrap_or(0);
        format!(
            "process {} exceeded memory limit: {} MB > {} MB",
            handle.pid,
            memory_mb,
            self.per_process_limit_mb.unwrap_or(0)
        )
    }
}

/// Global cap + optional per-handle cap on CPU share. A task's required share
/// is `cpuCores · (100 / totalCores)` (spec.md §4.6).
pub struct CpuConstraint {
    pub max_total_percent: f64,
    pub per_process_limit_percent: Option<f64>,
    pub total_cores: u32,
}

impl Constraint for CpuConstraint {
    fn can_admit(&self, task: &Task, current: CurrentUsage) -> bool {
        let required_cores = task.resources.cpu_cores.unwrap_or(1);
        let cpu_per_core = 100.0 / self.total_cores.max(1) as f64;
        let required_cpu = required_cores as f64 * cpu_per_core;
        current.cpu_percent + required_cpu <= self.max_total_percent
    }

    fn is_violating(&self, handle: &ProcessHandle) -> bool {
        let Some(limit) = self.per_process_limit_percent else {
            return false;
        };
        handle
            .latest_metric()
            .map(|m| m.cpu_percent > limit)
            .unwrap_or(false)
    }

    fn message(&self, handle: &ProcessHandle) -> String {
        let cpu = handle.latest_metric().map(|m| m.cpu_percent).unwrap_or(0.0);
        format!(
            "process {} exceeded cpu limit: {cpu:.1}% > {:.1}%",
            handle.pid,
            self.per_process_limit_percent.unwrap_or(0.0)
        )
    }
}

/// Handle runtime vs `max_runtime_seconds` (spec.md §4.6).
pub struct TimeConstraint {
    pub max_runtime_seconds: u64,
}

impl Constraint for TimeConstraint {
    fn can_admit(&self, _task: &Task, _current: CurrentUsage) -> bool {
        true
    }

    fn is_violating(&self, handle: &ProcessHandle) -> bool {
        if !handle.state.is_live() {
            return false;
        }
        handle
            .started_at
            .elapsed()
            .map(|d| d.as_secs() > self.max_runtime_seconds)
            .unwrap_or(false)
    }

    fn message(&self, handle: &ProcessHandle) -> String {
        let runtime = handle.started_at.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        format!(
            "process {} exceeded time limit: {runtime}s > {}s",
            handle.pid, self.max_runtime_seconds
        )
    }
}

/// Conjunctive composition: admits iff all admit, flags violation if any flags
/// (spec.md §4.6).
pub struct CompositeConstraint {
    constraints: Vec<Box<dyn Constraint>>,
}

impl CompositeConstraint {
    pub fn new(constraints: Vec<Box<dyn Constraint>>) -> Self {
        Self { constraints }
    }
}

impl Constraint for CompositeConstraint {
    fn can_admit(&self, task: &Task, current: CurrentUsage) -> bool {
        self.constraints.iter().all(|c| c.can_admit(task, current))
    }

    fn is_violating(&self, handle: &ProcessHandle) -> bool {
        self.constraints.iter().any(|c| c.is_violating(handle))
    }

    fn message(&self, handle: &ProcessHandle) -> String {
        self.constraints
            .iter()
            .filter(|c| c.is_violating(handle))
            .map(|c| c.message(handle))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Enforces a constraint on running handles, tracking a per-task violation
/// counter; in "kill on violation" mode the first runtime violation initiates
/// termination (spec.md §4.6).
pub struct ConstraintEnforcer<C: Constraint> {
    constraint: C,
    kill_on_violation: bool,
    violations: HashMap<TaskId, u32>,
}

impl<C: Constraint> ConstraintEnforcer<C> {
    pub fn new(constraint: C, kill_on_violation: bool) -> Self {
        Self {
            constraint,
            kill_on_violation,
            violations: HashMap::new(),
        }
    }

    /// Returns `true` if the handle violates the constraint; records the
    /// violation and logs it. The caller decides whether to act on
    /// `kill_on_violation()`.
    pub fn check(&mut self, task_id: TaskId, handle: &ProcessHandle) -> bool {
        if self.constraint.is_violating(handle) {
            *self.violations.entry(task_id).or_insert(0) += 1;
            log::warn!("constraint violation: {}", self.constraint.message(handle));
            true
        } else {
            false
        }
    }

    pub fn kill_on_violation(&self) -> bool {
        self.kill_on_violation
    }

    pub fn can_admit(&self, task: &Task, current: CurrentUsage) -> bool {
        self.constraint.can_admit(task, current)
    }

    pub fn violation_count(&self, task_id: TaskId) -> u32 {
        self.violations.get(&task_id).copied().unwrap_or(0)
    }

    pub fn reset_violations(&mut self, task_id: TaskId) {
        self.violations.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;
    use nix::unistd::Pid;

    fn handle_with_memory(memory_mb: u64) -> ProcessHandle {
        let mut handle = ProcessHandle::new(Pid::from_raw(1));
        handle.state = ProcessState::Running;
        handle.push_metric(crate::process::ProcessMetric {
            memory_mb,
            ..Default::default()
        });
        handle
    }

    #[test]
    fn memory_constraint_admission_is_additive() {
        let constraint = MemoryConstraint {
            max_total_mb: 1024,
            per_process_limit_mb: None,
        };
        let task = TaskBuilder::new("t", "afl").memory_limit_mb(600).build();
        assert!(constraint.can_admit(&task, CurrentUsage { memory_mb: 400, cpu_percent: 0.0 }));
        assert!(!constraint.can_admit(&task, CurrentUsage { memory_mb: 500, cpu_percent: 0.0 }));
    }

    #[test]
    fn memory_constraint_flags_per_process_violation() {
        let constraint = MemoryConstraint {
            max_total_mb: 4096,
            per_process_limit_mb: Some(512),
        };
        assert!(constraint.is_violating(&handle_with_memory(600)));
        assert!(!constraint.is_violating(&handle_with_memory(400)));
    }

    #[test]
    fn composite_requires_all_to_admit() {
        let composite = CompositeConstraint::new(vec![
            Box::new(MemoryConstraint {
                max_total_mb: 1024,
                per_process_limit_mb: None,
            }),
            Box::new(CpuConstraint {
                max_total_percent: 50.0,
                per_process_limit_percent: None,
                total_cores: 4,
            }),
        ]);
        let task = TaskBuilder::new("t", "afl").memory_limit_mb(100).cpu_cores(8).build();
        assert!(!composite.can_admit(&task, CurrentUsage::default()));
    }

    #[test]
    fn enforcer_tracks_violation_counts() {
        let constraint = MemoryConstraint {
            max_total_mb: 4096,
            per_process_limit_mb: Some(100),
        };
        let mut enforcer = ConstraintEnforcer::new(constraint, false);
        let task_id = TaskId::new();
        let handle = handle_with_memory(200);
        assert!(enforcer.check(task_id, &handle));
        assert!(enforcer.check(task_id, &handle));
        assert_eq!(enforcer.violation_count(task_id), 2);
        enforcer.reset_violations(task_id);
        assert_eq!(enforcer.violation_count(task_id), 0);
    }
}
