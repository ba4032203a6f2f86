//! The per-task process handle: OS pid, lifecycle state, and a sliding window of
//! metric samples (spec.md §3, `ProcessHandle`).

use std::collections::VecDeque;
use std::time::SystemTime;

use nix::unistd::Pid;

const DEFAULT_METRIC_WINDOW: usize = 120;

/// Handle lifecycle (spec.md §4.3): `Created -> Running -> {Paused <-> Running}* ->
/// {Terminated | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Paused,
    Terminated,
    Failed,
}

impl ProcessState {
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Failed)
    }
}

/// One timestamped per-process-tree sample (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct ProcessMetric {
    pub timestamp: Option<SystemTime>,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub memory_percent: f64,
    pub thread_count: usize,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
}

/// Owned exclusively by the [`super::ProcessSupervisor`] for the duration
/// `Running ∪ Paused`. Memory accounting over the handle's tree is recursive: it
/// includes the root pid and all descendants alive at sample time.
pub struct ProcessHandle {
    pub pid: Pid,
    pub state: ProcessState,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub supervisor_initiated_stop: bool,
    metrics: VecDeque<ProcessMetric>,
    metric_window: usize,
}

impl ProcessHandle {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: ProcessState::Created,
            started_at: SystemTime::now(),
            ended_at: None,
            exit_code: None,
            supervisor_initiated_stop: false,
            metrics: VecDeque::new(),
            metric_window: DEFAULT_METRIC_WINDOW,
        }
    }

    pub fn push_metric(&mut self, metric: ProcessMetric) {
        self.metrics.push_back(metric);
        if self.metrics.len() > self.metric_window {
            self.metrics.pop_front();
        }
    }

    pub fn latest_metric(&self) -> Option<&ProcessMetric> {
        self.metrics.back()
    }

    pub fn metrics(&self) -> &VecDeque<ProcessMetric> {
        &self.metrics
    }

    /// The classification the supervisor records on reap: any exit after a
    /// supervisor-initiated stop is `Terminated`; any other exit (spawn error or
    /// abnormal exit) is `Failed` (spec.md §4.3).
    pub fn classify_exit(&self, exit_code: i32) -> ProcessState {
        if self.supervisor_initiated_stop || exit_code == 0 {
            ProcessState::Terminated
        } else {
            ProcessState::Failed
        }
    }
}
