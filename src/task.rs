//! Task: the immutable description and mutable lifecycle state of one fuzzing job.
//!
//! See spec.md §3 and §4.1. A [`Task`] is a passive value — it never spawns a
//! process or touches the filesystem itself; the [`crate::orchestrator::Orchestrator`]
//! and [`crate::scheduler::Scheduler`] own those effects.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, opaque task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle states (spec.md §3): `Pending -> Scheduled -> Running ->
/// {Completed|Failed|Cancelled}`, with `Running <-> Paused` as a reversible
/// side-loop. Once a task reaches a terminal state it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Scheduling priority, ordinal and ascending: `Idle` is least urgent, `Critical`
/// most. The numeric value is used directly by the priority strategy's preemption
/// threshold (spec.md §4.7: preempt iff the gap is >= 25).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    Idle = 0,
    Low = 25,
    Normal = 50,
    High = 75,
    Critical = 100,
}

impl TaskPriority {
    pub fn value(self) -> i32 {
        self as i32
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Resource requirements a task may declare; unset fields place no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub memory_limit_mb: Option<u64>,
    pub cpu_cores: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Filesystem paths a task's adapter will read from or populate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPaths {
    pub seed_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub corpus_dir: Option<PathBuf>,
}

/// Lifecycle timestamps and terminal-state metadata.
#[derive(Debug, Clone, Default)]
pub struct TaskLifecycle {
    pub created_at: Option<SystemTime>,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// A single fuzzing job: identity, command, resource requirements, and lifecycle
/// state (spec.md §3). The `command` is always stored tokenized; callers may supply
/// either a single shell-like string or a pre-tokenized vector via [`TaskBuilder`].
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub fuzzer_kind: String,
    pub command: Vec<String>,
    pub resources: ResourceRequirements,
    pub paths: TaskPaths,
    /// Fuzzer-specific configuration, opaque to the scheduler and interpreted only
    /// by the matching adapter (spec.md §3, §9).
    pub fuzzer_config: serde_json::Map<String, serde_json::Value>,
    pub priority: TaskPriority,
    pub tags: HashSet<String>,
    pub dependencies: HashSet<TaskId>,
    pub status: TaskStatus,
    pub lifecycle: TaskLifecycle,
}

impl Task {
    /// Tokenizes a command string with POSIX shell-like splitting, or passes a
    /// pre-tokenized vector through unchanged (spec.md §4.1).
    pub fn tokenize_command(raw: &str) -> crate::Result<Vec<String>> {
        shell_words::split(raw)
            .map_err(|e| crate::Error::Config(format!("invalid command string: {e}")))
    }

    /// `Pending` with no outstanding dependency set.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Pending && self.dependencies.is_empty()
    }

    /// Checks each set resource field against the available amount componentwise.
    pub fn can_fit_resources(&self, avail_mem_mb: u64, avail_cores: u32) -> bool {
        let mem_ok = self
            .resources
            .memory_limit_mb
            .map_or(true, |need| need <= avail_mem_mb);
        let cpu_ok = self
            .resources
            .cpu_cores
            .map_or(true, |need| need <= avail_cores);
        mem_ok && cpu_ok
    }

    /// Applies a status transition and timestamps it. `Running` sets `started_at`
    /// (only the first time); terminal statuses set `completed_at`.
    pub fn update_status(&mut self, new_status: TaskStatus) {
        self.status = new_status;
        match new_status {
            TaskStatus::Running if self.lifecycle.started_at.is_none() => {
                self.lifecycle.started_at = Some(SystemTime::now());
            }
            _ if new_status.is_terminal() => {
                self.lifecycle.completed_at = Some(SystemTime::now());
            }
            _ => {}
        }
    }

    /// Wall-clock duration from `started_at` to `completed_at`, or to now if still
    /// running.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.lifecycle.started_at?;
        let end = self.lifecycle.completed_at.unwrap_or_else(SystemTime::now);
        end.duration_since(started).ok()
    }
}

/// Builder mirroring the task-file schema of spec.md §6; fills in sensible
/// defaults (new id, `created_at = now`, `Pending`, `Normal` priority).
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>, fuzzer_kind: impl Into<String>) -> Self {
        Self {
            task: Task {
                id: TaskId::new(),
                name: name.into(),
                fuzzer_kind: fuzzer_kind.into(),
                command: Vec::new(),
                resources: ResourceRequirements::default(),
                paths: TaskPaths::default(),
                fuzzer_config: serde_json::Map::new(),
                priority: TaskPriority::default(),
                tags: HashSet::new(),
                dependencies: HashSet::new(),
                status: TaskStatus::Pending,
                lifecycle: TaskLifecycle {
                    created_at: Some(SystemTime::now()),
                    ..Default::default()
                },
            },
        }
    }

    pub fn command_vec(mut self, command: Vec<String>) -> Self {
        self.task.command = command;
        self
    }

    pub fn command_str(mut self, command: &str) -> crate::Result<Self> {
        self.task.command = Task::tokenize_command(command)?;
        Ok(self)
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.task.resources.memory_limit_mb = Some(mb);
        self
    }

    pub fn cpu_cores(mut self, cores: u32) -> Self {
        self.task.resources.cpu_cores = Some(cores);
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.task.resources.timeout_seconds = Some(seconds);
        self
    }

    pub fn seed_dir(mut self, dir: PathBuf) -> Self {
        self.task.paths.seed_dir = Some(dir);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.task.tags = tags.into_iter().collect();
        self
    }

    pub fn dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.task.dependencies = deps.into_iter().collect();
        self
    }

    pub fn fuzzer_config(mut self, config: serde_json::Map<String, serde_json::Value>) -> Self {
        self.task.fuzzer_config = config;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_shell_like_strings() {
        let tokens = Task::tokenize_command("afl-fuzz -i in -o out -- ./target @@").unwrap();
        assert_eq!(
            tokens,
            vec!["afl-fuzz", "-i", "in", "-o", "out", "--", "./target", "@@"]
        );
    }

    #[test]
    fn is_ready_requires_pending_and_no_deps() {
        let mut task = TaskBuilder::new("t1", "afl").build();
        assert!(task.is_ready());
        task.dependencies.insert(TaskId::new());
        assert!(!task.is_ready());
        task.dependencies.clear();
        task.status = TaskStatus::Running;
        assert!(!task.is_ready());
    }

    #[test]
    fn can_fit_resources_is_componentwise() {
        let task = TaskBuilder::new("t1", "afl")
            .memory_limit_mb(512)
            .cpu_cores(2)
            .build();
        assert!(task.can_fit_resources(512, 2));
        assert!(!task.can_fit_resources(511, 2));
        assert!(!task.can_fit_resources(512, 1));
        assert!(task.can_fit_resources(1024, 8));
    }

    #[test]
    fn update_status_sets_started_and_completed() {
        let mut task = TaskBuilder::new("t1", "afl").build();
        assert!(task.lifecycle.started_at.is_none());
        task.update_status(TaskStatus::Running);
        assert!(task.lifecycle.started_at.is_some());
        assert!(task.lifecycle.completed_at.is_none());
        task.update_status(TaskStatus::Completed);
        assert!(task.lifecycle.completed_at.is_some());
    }

    #[test]
    fn duration_is_none_before_start() {
        let task = TaskBuilder::new("t1", "afl").build();
        assert!(task.duration().is_none());
    }
}
