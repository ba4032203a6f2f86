//! Composition root: wires the adapter registry, process supervisor,
//! resource monitor, metrics registry, constraint enforcement, and scheduler
//! into one campaign driver (spec.md §4.8), grounded on the original
//! `Orchestrator` class (`examples/original_source/src/fuzzflow/orchestrator.py`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::System;

use crate::adapters::AdapterRegistry;
use crate::config::OrchestratorConfig;
use crate::constraints::{
    CompositeConstraint, ConstraintEnforcer, CpuConstraint, CurrentUsage, MemoryConstraint,
    TimeConstraint,
};
use crate::metrics::MetricsRegistry;
use crate::process::ProcessSupervisor;
use crate::resource::ResourceMonitor;
use crate::scheduler::{Budget, FairShareStrategy, PriorityStrategy, Scheduler, SchedulingStrategy};
use crate::task::{Task, TaskId, TaskStatus};
use crate::{Error, Result};

/// A snapshot of a flagged-stalled-and-inefficient task (spec.md §4.8, no
/// automatic action taken on it in v1).
#[derive(Debug, Clone)]
pub struct StallAlert {
    pub task_id: TaskId,
    pub task_name: String,
    pub efficiency: f64,
}

/// Point-in-time view handed to operators/UI (spec.md §4.8 `statistics()`).
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub memory_exhaustion_eta_seconds: Option<f64>,
    pub stalled: Vec<StallAlert>,
}

struct RestartState {
    attempts: u32,
}

/// The campaign driver. Owns every mutable subsystem behind a single mutex;
/// the periodic roles of spec.md §5 (scheduler tick, cleanup, host sampler,
/// metrics loop) each take the lock only for the duration of one iteration,
/// never while sleeping or blocked on a child process.
pub struct Orchestrator {
    config: OrchestratorConfig,
    output_dir: PathBuf,
    adapters: AdapterRegistry,
    inner: Mutex<Inner>,
    shutdown: Arc<AtomicBool>,
}

struct Inner {
    scheduler: Scheduler,
    supervisor: ProcessSupervisor,
    resource_monitor: ResourceMonitor,
    metrics: MetricsRegistry,
    system: System,
    enforcer: ConstraintEnforcer<CompositeConstraint>,
    restarts: HashMap<TaskId, RestartState>,
    task_fuzzer_kind: HashMap<TaskId, String>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, adapters: AdapterRegistry) -> Self {
        let total_cores = num_cpus();
        let strategy: Box<dyn SchedulingStrategy> = if config.fair_share_weights.is_empty() {
            Box::new(PriorityStrategy::new(config.enable_preemption))
        } else {
            Box::new(FairShareStrategy::new(config.fair_share_weights.clone()))
        };
        let scheduler = Scheduler::new(strategy, config.max_parallel_tasks);
        let supervisor = ProcessSupervisor::new(config.max_parallel_tasks);

        let mut constraints: Vec<Box<dyn crate::constraints::Constraint>> = Vec::new();
        constraints.push(Box::new(MemoryConstraint {
            max_total_mb: config.memory_limit_mb.unwrap_or(u64::MAX),
            per_process_limit_mb: config.memory_limit_mb,
        }));
        constraints.push(Box::new(CpuConstraint {
            max_total_percent: config.cpu_limit_percent.unwrap_or(100.0 * total_cores as f64),
            per_process_limit_percent: config.cpu_limit_percent,
            total_cores,
        }));
        constraints.push(Box::new(TimeConstraint {
            max_runtime_seconds: u64::MAX,
        }));
        let enforcer = ConstraintEnforcer::new(
            CompositeConstraint::new(constraints),
            config.kill_on_violation,
        );

        let output_dir = PathBuf::from(&config.output_dir);

        Self {
            output_dir,
            adapters,
            inner: Mutex::new(Inner {
                scheduler,
                supervisor,
                resource_monitor: ResourceMonitor::default(),
                metrics: MetricsRegistry::default(),
                system: System::new_all(),
                enforcer,
                restarts: HashMap::new(),
                task_fuzzer_kind: HashMap::new(),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Validates setup, prepares the corpus, rewrites `task.command` via the
    /// adapter, merges adapter environment, registers the metric provider, and
    /// enqueues the task (spec.md §4.8 `submitTask`).
    pub fn submit_task(&self, mut task: Task) -> Result<TaskId> {
        let adapter = self.adapters.get(&task.fuzzer_kind)?;
        let task_dir = self.output_dir.join(&task.name);
        std::fs::create_dir_all(&task_dir).map_err(Error::Io)?;
        for sub in ["input", "corpus", "output"] {
            std::fs::create_dir_all(task_dir.join(sub)).map_err(Error::Io)?;
        }

        let binary_path = task
            .command
            .first()
            .map(PathBuf::from)
            .ok_or_else(|| Error::InvalidTask {
                name: task.name.clone(),
                reason: "command must not be empty".into(),
            })?;

        adapter
            .validate_setup(&binary_path, &task_dir)
            .map_err(|reason| Error::SetupInvalid { task: task.id, reason })?;

        if let Some(seed_dir) = task.paths.seed_dir.clone() {
            let corpus_dir = task_dir.join("corpus");
            adapter.prepare_corpus(&seed_dir, &corpus_dir, &task)?;
            task.paths.corpus_dir = Some(corpus_dir);
        }
        task.paths.output_dir = Some(task_dir.clone());

        task.command = adapter.build_command(&task, &binary_path, &task_dir);

        let id = task.id;
        let kind = task.fuzzer_kind.clone();
        let provider = adapter.metric_provider(&task_dir, &task);

        let mut inner = self.inner.lock().expect("orchestrator mutex poisoned");
        inner.metrics.register(id, provider);
        inner.task_fuzzer_kind.insert(id, kind);
        inner.scheduler.submit(task);
        log::info!("task {id} submitted");
        Ok(id)
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock().expect("orchestrator mutex poisoned").scheduler.has_pending()
    }

    /// One full cycle of the spec.md §4.7 loop plus the §4.8 metrics pass.
    /// Intended to be called repeatedly by a host-owned loop (e.g. the `run`
    /// CLI subcommand) at `scheduling_interval_seconds` cadence.
    pub fn tick(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().expect("orchestrator mutex poisoned");
        let Inner {
            scheduler,
            supervisor,
            resource_monitor,
            metrics,
            system,
            enforcer,
            restarts,
            task_fuzzer_kind,
        } = &mut *inner;

        resource_monitor.sample();

        let running_ids: Vec<TaskId> = scheduler.running().map(|t| t.id).collect();
        let mut exited = Vec::new();
        for id in running_ids {
            if let Ok(metric) = supervisor.sample_tree(id, system) {
                if enforcer.check(id, supervisor.handle(id).expect("just sampled")) && enforcer.kill_on_violation() {
                    log::warn!("killing task {id} for constraint violation");
                    let _ = supervisor.terminate(id, Duration::from_secs(self.config.shutdown_grace_seconds));
                }
                let _ = metric;
            }
            if let Ok(Some(exit_code)) = supervisor.poll_exit(id) {
                exited.push((id, exit_code));
            }
        }

        let adapters = &self.adapters;
        let output_dir = &self.output_dir;
        let auto_restart = self.config.auto_restart;
        let max_restart_attempts = self.config.max_restart_attempts;
        let restarted = Mutex::new(Vec::new());

        scheduler.reap(
            &exited,
            |task| {
                if let Some(kind) = task_fuzzer_kind.get(&task.id) {
                    if let Ok(adapter) = adapters.get(kind) {
                        let task_dir = output_dir.join(&task.name);
                        let result = adapter.post_process(&task_dir, task);
                        log::info!(
                            "task {} completed: {} crashes, corpus size {}",
                            task.name,
                            result.crashes.len(),
                            result.corpus_size
                        );
                    }
                }
            },
            |task| {
                log::warn!("task {} failed", task.name);
                if auto_restart {
                    let state = restarts.entry(task.id).or_insert(RestartState { attempts: 0 });
                    if state.attempts < max_restart_attempts {
                        state.attempts += 1;
                        restarted.lock().unwrap().push(task.clone());
                    }
                }
            },
        );
        for mut task in restarted.into_inner().unwrap() {
            task.status = TaskStatus::Pending;
            task.lifecycle.started_at = None;
            task.lifecycle.completed_at = None;
            log::info!("auto-restarting task {}", task.name);
            scheduler.submit(task);
        }

        let usage = resource_monitor.current_usage();
        let used_mb = usage.map(|u| u.used_memory_mb).unwrap_or(0);
        let current = CurrentUsage {
            memory_mb: used_mb,
            cpu_percent: usage.map(|u| u.cpu_percent).unwrap_or(0.0),
        };
        let available_mb = self
            .config
            .memory_limit_mb
            .map(|limit| limit.saturating_sub(used_mb))
            .unwrap_or(u64::MAX);
        let budget = Budget {
            available_mb,
            available_cores: num_cpus(),
        };

        let enforcer_ref = &*enforcer;
        scheduler.elect(budget, |task, _budget| {
            if !enforcer_ref.can_admit(task, current) {
                return false;
            }
            let task_dir = output_dir.join(&task.name);
            let Some(kind) = task_fuzzer_kind.get(&task.id) else {
                return false;
            };
            let Ok(adapter) = adapters.get(kind) else {
                return false;
            };
            let env = adapter.environment(task);
            supervisor.spawn(task.id, &task.command, &task_dir, &env).is_ok()
        });

        for id in scheduler.running().map(|t| t.id).collect::<Vec<_>>() {
            if let Some(sample) = metrics.collect(id) {
                if self.config.adaptive_scheduling
                    && metrics.is_stalled(id, self.config.stall_threshold_seconds)
                    && metrics.efficiency(id) < self.config.efficiency_threshold
                {
                    log::warn!(
                        "task {id} flagged: stalled and low efficiency ({:.1})",
                        metrics.efficiency(id)
                    );
                }
                let _ = sample;
            }
        }

        supervisor.drop_reaped();
    }

    pub fn pause_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("orchestrator mutex poisoned");
        let ids: Vec<TaskId> = inner.scheduler.running().map(|t| t.id).collect();
        for id in ids {
            inner.supervisor.pause(id)?;
        }
        Ok(())
    }

    pub fn resume_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("orchestrator mutex poisoned");
        let ids: Vec<TaskId> = inner.scheduler.running().map(|t| t.id).collect();
        for id in ids {
            inner.supervisor.resume(id)?;
        }
        Ok(())
    }

    /// Cooperative shutdown (spec.md §5): idempotent after the first call.
    pub fn stop_all(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().expect("orchestrator mutex poisoned");
        inner
            .supervisor
            .shutdown(Duration::from_secs(self.config.shutdown_grace_seconds));
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock().expect("orchestrator mutex poisoned");
        let stats = inner.scheduler.statistics();
        let stalled = inner
            .scheduler
            .running()
            .filter(|t| inner.metrics.is_stalled(t.id, self.config.stall_threshold_seconds))
            .map(|t| StallAlert {
                task_id: t.id,
                task_name: t.name.clone(),
                efficiency: inner.metrics.efficiency(t.id),
            })
            .collect();
        Statistics {
            pending: stats.pending,
            running: stats.running,
            completed: stats.completed,
            tasks_scheduled: stats.tasks_scheduled,
            tasks_completed: stats.tasks_completed,
            tasks_failed: stats.tasks_failed,
            memory_exhaustion_eta_seconds: inner.resource_monitor.predict_memory_exhaustion(),
            stalled,
        }
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;
    use tempfile::tempdir;

    fn test_orchestrator(dir: &std::path::Path) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.output_dir = dir.to_string_lossy().to_string();
        config.max_parallel_tasks = 2;
        Orchestrator::new(config, AdapterRegistry::default())
    }

    #[test]
    fn submit_unknown_fuzzer_kind_fails_fast() {
        let dir = tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let task = TaskBuilder::new("t1", "honggfuzz")
            .command_vec(vec!["true".to_string()])
            .build();
        let result = orchestrator.submit_task(task);
        assert!(result.is_err());
    }

    #[test]
    fn has_pending_reflects_queue_state() {
        let dir = tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        assert!(!orchestrator.has_pending());
    }

    #[test]
    fn stop_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        orchestrator.stop_all();
        orchestrator.stop_all();
    }
}
