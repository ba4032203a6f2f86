//! Spawns, pauses, resumes, and terminates per-task processes, and answers
//! per-tree resource queries (spec.md §4.3).

use std::collections::{HashMap, HashSet};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, System};

use crate::task::TaskId;
use crate::{Error, Result};

use super::handle::{ProcessHandle, ProcessMetric, ProcessState};

/// Spawns a Task's command, exposes OS-level lifecycle controls, and samples
/// per-process-tree metrics. Invariant: at most one handle per task, and
/// `max_processes` bounds concurrent `Running ∪ Paused` handles (spec.md §4.3).
pub struct ProcessSupervisor {
    handles: HashMap<TaskId, ProcessHandle>,
    max_processes: usize,
    shutting_down: bool,
}

impl ProcessSupervisor {
    pub fn new(max_processes: usize) -> Self {
        Self {
            handles: HashMap::new(),
            max_processes,
            shutting_down: false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.handles.values().filter(|h| h.state.is_live()).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.live_count() < self.max_processes
    }

    pub fn handle(&self, task_id: TaskId) -> Option<&ProcessHandle> {
        self.handles.get(&task_id)
    }

    /// Spawns `argv` (first element is the program) in `work_dir` with the given
    /// extra environment variables. Fails without mutating any counters if the
    /// supervisor is shutting down, already at capacity, or already holds a live
    /// handle for this task (spec.md §4.3 invariant).
    pub fn spawn(
        &mut self,
        task_id: TaskId,
        argv: &[String],
        work_dir: &std::path::Path,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        if self.shutting_down {
            return Err(Error::SetupInvalid {
                task: task_id,
                reason: "supervisor is shutting down".into(),
            });
        }
        if !self.has_capacity() {
            return Err(Error::SetupInvalid {
                task: task_id,
                reason: "at max_processes capacity".into(),
            });
        }
        if self.handles.get(&task_id).is_some_and(|h| h.state.is_live()) {
            return Err(Error::SetupInvalid {
                task: task_id,
                reason: "task already has a live handle".into(),
            });
        }

        let Some((program, args)) = argv.split_first() else {
            return Err(Error::SetupInvalid {
                task: task_id,
                reason: "empty command".into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .envs(env)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            task: task_id,
            source,
        })?;

        let mut handle = ProcessHandle::new(Pid::from_raw(child.id() as i32));
        handle.state = ProcessState::Running;
        self.handles.insert(task_id, handle);
        // `child` is intentionally dropped here: we track the process by pid and
        // reap it ourselves via `waitpid`, not through `std::process::Child::wait`.
        drop(child);
        log::info!("spawned task {task_id}");
        Ok(())
    }

    pub fn pause(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.require_handle(task_id)?;
        if handle.state != ProcessState::Running {
            return Ok(());
        }
        kill(handle.pid, Signal::SIGSTOP).map_err(|e| Error::Adapter {
            task: task_id,
            reason: format!("SIGSTOP failed: {e}"),
        })?;
        handle.state = ProcessState::Paused;
        Ok(())
    }

    pub fn resume(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.require_handle(task_id)?;
        if handle.state != ProcessState::Paused {
            return Ok(());
        }
        kill(handle.pid, Signal::SIGCONT).map_err(|e| Error::Adapter {
            task: task_id,
            reason: format!("SIGCONT failed: {e}"),
        })?;
        handle.state = ProcessState::Running;
        Ok(())
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL and wait unconditionally
    /// (spec.md §4.3 termination protocol).
    pub fn terminate(&mut self, task_id: TaskId, timeout: Duration) -> Result<()> {
        let pid = {
            let handle = self.require_handle(task_id)?;
            if !handle.state.is_live() {
                return Ok(());
            }
            handle.supervisor_initiated_stop = true;
            let _ = kill(handle.pid, Signal::SIGTERM);
            handle.pid
        };

        let deadline = Instant::now() + timeout;
        let exit_code = loop {
            if let Some(code) = Self::try_reap(pid) {
                break code;
            }
            if Instant::now() >= deadline {
                let _ = kill(pid, Signal::SIGKILL);
                let code = loop {
                    if let Some(code) = Self::try_reap(pid) {
                        break code;
                    }
                    thread::sleep(Duration::from_millis(50));
                };
                break code;
            }
            thread::sleep(Duration::from_millis(50));
        };

        let handle = self.require_handle(task_id)?;
        handle.exit_code = Some(exit_code);
        handle.ended_at = Some(SystemTime::now());
        handle.state = ProcessState::Terminated;
        Ok(())
    }

    /// Records a reap observed by the scheduler's own polling loop; classifies
    /// the handle per spec.md §4.3 and returns the final state.
    pub fn record_exit(&mut self, task_id: TaskId, exit_code: i32) -> Result<ProcessState> {
        let handle = self.require_handle(task_id)?;
        let final_state = handle.classify_exit(exit_code);
        handle.exit_code = Some(exit_code);
        handle.ended_at = Some(SystemTime::now());
        handle.state = final_state;
        Ok(final_state)
    }

    /// Non-blocking poll used by the scheduler's reap step: if the handle's
    /// process has exited, records the exit on the handle (classifying
    /// Terminated/Failed) and returns its exit code; `None` if still running.
    pub fn poll_exit(&mut self, task_id: TaskId) -> Result<Option<i32>> {
        let pid = {
            let handle = self.require_handle(task_id)?;
            if !handle.state.is_live() {
                return Ok(handle.exit_code);
            }
            handle.pid
        };
        match Self::try_reap(pid) {
            Some(code) => {
                self.record_exit(task_id, code)?;
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Non-blocking reap attempt; `Some(exit_code)` if the process has exited
    /// (normally or via signal), `None` if still running.
    fn try_reap(pid: Pid) -> Option<i32> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(128 + signal as i32),
            Ok(WaitStatus::StillAlive) | Ok(_) => None,
            Err(_) => Some(-1),
        }
    }

    /// True if the process is no longer live (reaped, or never spawned).
    pub fn is_reaped(&self, task_id: TaskId) -> bool {
        match self.handles.get(&task_id) {
            Some(h) => !h.state.is_live() || Self::try_reap(h.pid).is_some(),
            None => true,
        }
    }

    /// Drops handles that have reached a terminal state (spec.md §4.7, the
    /// scheduler's periodic cleanup loop).
    pub fn drop_reaped(&mut self) {
        self.handles.retain(|_, h| !h.state.is_terminal());
    }

    /// Samples cpu/memory/threads for a handle's entire process tree (root +
    /// descendants), tolerating processes that vanish mid-walk.
    pub fn sample_tree(&mut self, task_id: TaskId, system: &mut System) -> Result<ProcessMetric> {
        let handle = self.require_handle(task_id)?;
        let root = SysPid::from_u32(handle.pid.as_raw() as u32);
        system.refresh_specifics(
            sysinfo::RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        );

        let mut tree: HashSet<SysPid> = HashSet::new();
        tree.insert(root);
        let mut frontier = vec![root];
        while let Some(pid) = frontier.pop() {
            for (candidate_pid, process) in system.processes() {
                if process.parent() == Some(pid) && tree.insert(*candidate_pid) {
                    frontier.push(*candidate_pid);
                }
            }
        }

        let mut memory_mb = 0u64;
        let mut cpu_percent = 0f64;
        let mut thread_count = 0usize;
        for pid in &tree {
            if let Some(process) = system.process(*pid) {
                memory_mb += process.memory() / (1024 * 1024);
                cpu_percent += process.cpu_usage() as f64;
                thread_count += 1;
            }
        }

        let total_mem = system.total_memory();
        let memory_percent = if total_mem > 0 {
            (memory_mb * 1024 * 1024) as f64 / total_mem as f64 * 100.0
        } else {
            0.0
        };

        let metric = ProcessMetric {
            timestamp: Some(SystemTime::now()),
            cpu_percent,
            memory_mb,
            memory_percent,
            thread_count,
            io_read_bytes: 0,
            io_write_bytes: 0,
        };
        self.handles
            .get_mut(&task_id)
            .expect("checked above")
            .push_metric(metric.clone());
        Ok(metric)
    }

    /// Ordered shutdown (spec.md §4.3/§5): stop admitting new spawns, send
    /// SIGTERM to every live handle up front so the grace period overlaps across
    /// tasks, then wait each one out to SIGKILL if needed.
    pub fn shutdown(&mut self, grace: Duration) {
        self.shutting_down = true;
        let ids: Vec<TaskId> = self
            .handles
            .iter()
            .filter(|(_, h)| h.state.is_live())
            .map(|(id, _)| *id)
            .collect();

        for &id in &ids {
            if let Some(handle) = self.handles.get_mut(&id) {
                handle.supervisor_initiated_stop = true;
                let _ = kill(handle.pid, Signal::SIGTERM);
            }
        }
        for id in ids {
            let _ = self.terminate(id, grace);
        }
    }

    fn require_handle(&mut self, task_id: TaskId) -> Result<&mut ProcessHandle> {
        self.handles
            .get_mut(&task_id)
            .ok_or(Error::NoSuchHandle(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn spawn_rejects_empty_command() {
        let mut sup = ProcessSupervisor::new(4);
        let id = TaskId::new();
        let result = sup.spawn(id, &[], &PathBuf::from("."), &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn spawn_and_terminate_true_process() {
        let mut sup = ProcessSupervisor::new(4);
        let id = TaskId::new();
        sup.spawn(
            id,
            &["sleep".to_string(), "5".to_string()],
            &PathBuf::from("."),
            &HashMap::new(),
        )
        .expect("spawn should succeed");
        assert_eq!(sup.live_count(), 1);
        sup.terminate(id, Duration::from_secs(2)).expect("terminate");
        assert!(sup.handle(id).unwrap().state.is_terminal());
    }

    #[test]
    fn poll_exit_observes_natural_completion() {
        let mut sup = ProcessSupervisor::new(4);
        let id = TaskId::new();
        sup.spawn(id, &["true".to_string()], &PathBuf::from("."), &HashMap::new())
            .expect("spawn should succeed");
        let mut exit_code = None;
        for _ in 0..50 {
            if let Some(code) = sup.poll_exit(id).unwrap() {
                exit_code = Some(code);
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(exit_code, Some(0));
        assert!(sup.handle(id).unwrap().state.is_terminal());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut sup = ProcessSupervisor::new(0);
        let id = TaskId::new();
        let result = sup.spawn(
            id,
            &["true".to_string()],
            &PathBuf::from("."),
            &HashMap::new(),
        );
        assert!(result.is_err());
    }
}
