//! Central registry: one [`MetricProvider`] per task id, a bounded sample history,
//! and the derived queries of spec.md §4.5.

use std::collections::{HashMap, VecDeque};

use crate::task::TaskId;

use super::types::{FuzzingMetrics, MetricProvider};

const DEFAULT_HISTORY: usize = 1000;

struct TaskMetrics {
    provider: Box<dyn MetricProvider>,
    history: VecDeque<FuzzingMetrics>,
}

/// Owns one bounded ring of [`FuzzingMetrics`] per task id; mutated only by the
/// orchestrator's metrics-collection loop (spec.md §5, "shared state discipline").
pub struct MetricsRegistry {
    tasks: HashMap<TaskId, TaskMetrics>,
    history_size: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl MetricsRegistry {
    pub fn new(history_size: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            history_size,
        }
    }

    pub fn register(&mut self, task_id: TaskId, provider: Box<dyn MetricProvider>) {
        log::debug!("registered metric provider for task {task_id}");
        self.tasks.insert(
            task_id,
            TaskMetrics {
                provider,
                history: VecDeque::new(),
            },
        );
    }

    pub fn unregister(&mut self, task_id: TaskId) {
        self.tasks.remove(&task_id);
    }

    /// Invokes the task's provider, appends the sample to its bounded ring, and
    /// returns it.
    pub fn collect(&mut self, task_id: TaskId) -> Option<FuzzingMetrics> {
        let entry = self.tasks.get_mut(&task_id)?;
        let sample = entry.provider.collect();
        entry.history.push_back(sample.clone());
        if entry.history.len() > self.history_size {
            entry.history.pop_front();
        }
        Some(sample)
    }

    pub fn is_stalled(&self, task_id: TaskId, threshold_seconds: u64) -> bool {
        self.tasks
            .get(&task_id)
            .map(|t| t.provider.is_stalled(threshold_seconds))
            .unwrap_or(false)
    }

    /// Weighted composite score in `[0, 100]` over the last <=10 samples (spec.md
    /// §4.5). Fewer than 2 samples yields the documented neutral default of 50.
    pub fn efficiency(&self, task_id: TaskId) -> f64 {
        let Some(entry) = self.tasks.get(&task_id) else {
            return 50.0;
        };
        let len = entry.history.len();
        if len < 2 {
            return 50.0;
        }
        let recent: Vec<&FuzzingMetrics> = entry
            .history
            .iter()
            .skip(len.saturating_sub(10))
            .collect();
        let last = recent.last().unwrap();
        let first = recent.first().unwrap();

        let exec_score = (last.executions_per_second / 1000.0 * 50.0).min(100.0);
        let path_rate = (last.total_paths as f64 - first.total_paths as f64) / recent.len() as f64;
        let path_score = (path_rate * 10.0).min(100.0);
        let crash_score = (last.unique_crashes as f64 * 20.0).min(100.0);
        let stability_score = last.stability_percent.min(100.0);

        let efficiency =
            exec_score * 0.2 + path_score * 0.3 + crash_score * 0.4 + stability_score * 0.1;
        efficiency.clamp(0.0, 100.0)
    }

    /// Task ids ranked by [`Self::efficiency`], highest first.
    pub fn top_n(&self, n: usize) -> Vec<(TaskId, f64)> {
        let mut scored: Vec<(TaskId, f64)> = self
            .tasks
            .keys()
            .map(|&id| (id, self.efficiency(id)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored
    }

    /// True if crashes grew in the last 5 samples, or the path discovery rate
    /// exceeds 10/sample; false if stalled for >= 1800s; defaults to true
    /// (spec.md §4.5 — new tasks get the benefit of the doubt).
    pub fn should_prioritize(&self, task_id: TaskId) -> bool {
        let Some(entry) = self.tasks.get(&task_id) else {
            return true;
        };
        let len = entry.history.len();
        if len < 5 {
            return true;
        }
        let recent: Vec<&FuzzingMetrics> = entry.history.iter().skip(len - 5).collect();
        let last = recent.last().unwrap();
        let first = recent.first().unwrap();

        if last.unique_crashes > first.unique_crashes {
            return true;
        }
        let path_rate = (last.total_paths as f64 - first.total_paths as f64) / recent.len() as f64;
        if path_rate > 10.0 {
            return true;
        }
        if self.is_stalled(task_id, 1800) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        samples: Vec<FuzzingMetrics>,
        idx: usize,
    }

    impl MetricProvider for FixedProvider {
        fn collect(&mut self) -> FuzzingMetrics {
            let sample = self.samples[self.idx.min(self.samples.len() - 1)].clone();
            self.idx += 1;
            sample
        }

        fn is_stalled(&self, _threshold_seconds: u64) -> bool {
            false
        }
    }

    fn sample(paths: u64, crashes: u64, execs_per_sec: f64, stability: f64) -> FuzzingMetrics {
        FuzzingMetrics {
            total_paths: paths,
            unique_crashes: crashes,
            executions_per_second: execs_per_sec,
            stability_percent: stability,
            ..Default::default()
        }
    }

    #[test]
    fn efficiency_defaults_to_fifty_below_two_samples() {
        let mut reg = MetricsRegistry::default();
        let id = TaskId::new();
        reg.register(
            id,
            Box::new(FixedProvider {
                samples: vec![sample(0, 0, 0.0, 100.0)],
                idx: 0,
            }),
        );
        assert_eq!(reg.efficiency(id), 50.0);
        reg.collect(id);
        assert_eq!(reg.efficiency(id), 50.0);
    }

    #[test]
    fn efficiency_rewards_crashes_and_paths() {
        let mut reg = MetricsRegistry::default();
        let id = TaskId::new();
        reg.register(
            id,
            Box::new(FixedProvider {
                samples: vec![sample(0, 0, 0.0, 100.0), sample(100, 2, 1000.0, 100.0)],
                idx: 0,
            }),
        );
        reg.collect(id);
        reg.collect(id);
        let eff = reg.efficiency(id);
        assert!(eff > 50.0, "expected high efficiency, got {eff}");
    }

    #[test]
    fn top_n_orders_descending() {
        let mut reg = MetricsRegistry::default();
        let low = TaskId::new();
        let high = TaskId::new();
        reg.register(
            low,
            Box::new(FixedProvider {
                samples: vec![sample(0, 0, 0.0, 0.0), sample(0, 0, 0.0, 0.0)],
                idx: 0,
            }),
        );
        reg.register(
            high,
            Box::new(FixedProvider {
                samples: vec![sample(0, 0, 0.0, 100.0), sample(500, 5, 2000.0, 100.0)],
                idx: 0,
            }),
        );
        reg.collect(low);
        reg.collect(low);
        reg.collect(high);
        reg.collect(high);

        let top = reg.top_n(2);
        assert_eq!(top[0].0, high);
    }

    #[test]
    fn should_prioritize_defaults_true_for_new_task() {
        let reg = MetricsRegistry::default();
        assert!(reg.should_prioritize(TaskId::new()));
    }
}
