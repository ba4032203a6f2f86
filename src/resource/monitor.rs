//! Host resource sampling, threshold alerts, and memory-exhaustion prediction
//! (spec.md §4.4), grounded on the original `ResourceMonitor` class
//! (`examples/original_source/src/fuzzflow/monitoring/resources.py`) and restyled
//! around `sysinfo` (spec.md §3, `ResourceUsage sample`).

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use sysinfo::System;

use super::types::{ResourceThresholds, ResourceUsage};

const DEFAULT_HISTORY: usize = 300;
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// The resource kind an alert callback is notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
}

type AlertCallback = Box<dyn Fn(ResourceKind, f64) + Send + Sync>;

/// Samples the host on demand (the orchestrator's sampler loop calls [`Self::sample`]
/// on its own tick, spec.md §5), retains a bounded ring of the last *H* samples, and
/// answers derived queries.
pub struct ResourceMonitor {
    system: System,
    history: VecDeque<ResourceUsage>,
    history_size: usize,
    sample_interval: Duration,
    thresholds: ResourceThresholds,
    alert_callbacks: Vec<AlertCallback>,
    last_disk_read: u64,
    last_disk_write: u64,
    last_net_rx: u64,
    last_net_tx: u64,
}

impl ResourceMonitor {
    pub fn new(history_size: usize, sample_interval: Duration, thresholds: ResourceThresholds) -> Self {
        Self {
            system: System::new_all(),
            history: VecDeque::with_capacity(history_size),
            history_size,
            sample_interval,
            thresholds,
            alert_callbacks: Vec::new(),
            last_disk_read: 0,
            last_disk_write: 0,
            last_net_rx: 0,
            last_net_tx: 0,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    pub fn add_alert_callback<F>(&mut self, callback: F)
    where
        F: Fn(ResourceKind, f64) + Send + Sync + 'static,
    {
        self.alert_callbacks.push(Box::new(callback));
    }

    /// Refreshes the underlying `sysinfo::System`, builds a [`ResourceUsage`]
    /// sample, appends it to the bounded ring, and fires any threshold alerts.
    /// Disk/network byte counters are left at zero here; a host that wants them
    /// populated can do so by extending [`ResourceUsage`] before insertion — the
    /// orchestrator's sampler owns the only mutable reference to this monitor
    /// (spec.md §5, "shared state discipline").
    pub fn sample(&mut self) -> ResourceUsage {
        self.system.refresh_memory();
        self.system.refresh_cpu();

        let total_memory_mb = self.system.total_memory() / (1024 * 1024);
        let used_memory_mb = self.system.used_memory() / (1024 * 1024);
        let available_memory_mb = total_memory_mb.saturating_sub(used_memory_mb);
        let memory_percent = if total_memory_mb > 0 {
            used_memory_mb as f64 / total_memory_mb as f64 * 100.0
        } else {
            0.0
        };

        let per_core: Vec<f64> = self
            .system
            .cpus()
            .iter()
            .map(|cpu| cpu.cpu_usage() as f64)
            .collect();
        let cpu_percent = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().sum::<f64>() / per_core.len() as f64
        };

        let usage = ResourceUsage {
            timestamp: Some(SystemTime::now()),
            total_memory_mb,
            used_memory_mb,
            available_memory_mb,
            memory_percent,
            cpu_percent,
            per_core_cpu_percent: per_core,
            disk_read_bytes: self.last_disk_read,
            disk_write_bytes: self.last_disk_write,
            network_rx_bytes: self.last_net_rx,
            network_tx_bytes: self.last_net_tx,
        };

        self.push_history(usage.clone());
        self.check_thresholds(&usage);
        usage
    }

    fn push_history(&mut self, usage: ResourceUsage) {
        self.history.push_back(usage);
        if self.history.len() > self.history_size {
            self.history.pop_front();
        }
    }

    fn check_thresholds(&self, usage: &ResourceUsage) {
        if usage.memory_percent > self.thresholds.memory_percent {
            self.fire_alert(ResourceKind::Memory, usage.memory_percent);
        }
        if usage.cpu_percent > self.thresholds.cpu_percent {
            self.fire_alert(ResourceKind::Cpu, usage.cpu_percent);
        }
    }

    fn fire_alert(&self, kind: ResourceKind, value: f64) {
        log::warn!("resource alert: {kind:?} at {value:.1}%");
        for callback in &self.alert_callbacks {
            callback(kind, value);
        }
    }

    pub fn current_usage(&self) -> Option<&ResourceUsage> {
        self.history.back()
    }

    /// Average memory/cpu usage over samples within the last `seconds`.
    pub fn average_usage(&self, seconds: u64) -> Option<(f64, f64)> {
        let cutoff = SystemTime::now().checked_sub(Duration::from_secs(seconds))?;
        let recent: Vec<&ResourceUsage> = self
            .history
            .iter()
            .filter(|u| u.timestamp.map(|t| t >= cutoff).unwrap_or(false))
            .collect();
        if recent.is_empty() {
            return None;
        }
        let n = recent.len() as f64;
        let mem = recent.iter().map(|u| u.used_memory_mb as f64).sum::<f64>() / n;
        let cpu = recent.iter().map(|u| u.cpu_percent).sum::<f64>() / n;
        Some((mem, cpu))
    }

    /// Peak used-memory MB over the retained window.
    pub fn peak_memory_mb(&self) -> Option<u64> {
        self.history.iter().map(|u| u.used_memory_mb).max()
    }

    /// Linear regression of used-MB vs time over the last 30 samples (spec.md
    /// §4.4). `None` ("no prediction") if fewer than 2 samples are available,
    /// the slope is non-positive, or the predicted time is not finite or
    /// exceeds 3600s.
    pub fn predict_memory_exhaustion(&self) -> Option<f64> {
        if self.history.len() < 2 {
            return None;
        }
        let recent: Vec<&ResourceUsage> = self
            .history
            .iter()
            .rev()
            .take(30)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if recent.len() < 2 {
            return None;
        }
        let base_time = recent.first()?.timestamp?;
        let points: Vec<(f64, f64)> = recent
            .iter()
            .filter_map(|u| {
                let t = u.timestamp?.duration_since(base_time).ok()?.as_secs_f64();
                Some((t, u.used_memory_mb as f64))
            })
            .collect();
        let n = points.len() as f64;
        if n < 2.0 {
            return None;
        }

        let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let numerator: f64 = points
            .iter()
            .map(|(x, y)| (x - x_mean) * (y - y_mean))
            .sum();
        let denominator: f64 = points.iter().map(|(x, _)| (x - x_mean).powi(2)).sum();
        if denominator == 0.0 {
            return None;
        }
        let slope = numerator / denominator;
        if slope <= 0.0 {
            return None;
        }

        let current = recent.last()?;
        let remaining_mb = current.total_memory_mb as f64 - current.used_memory_mb as f64;
        let seconds = remaining_mb / slope;
        if seconds.is_finite() && seconds > 0.0 && seconds <= 3600.0 {
            Some(seconds)
        } else {
            None
        }
    }

    /// Managed-pids variant (spec.md §4.4): admission allowed iff the managed
    /// process trees' aggregate RSS stays under 80% of `limit_mb`.
    pub fn can_admit_managed(managed_rss_mb: u64, limit_mb: u64) -> bool {
        (managed_rss_mb as f64) < 0.80 * limit_mb as f64
    }

    /// Critical warning threshold for the managed-pids variant: > 90% of `limit_mb`.
    pub fn is_critical_managed(managed_rss_mb: u64, limit_mb: u64) -> bool {
        (managed_rss_mb as f64) > 0.90 * limit_mb as f64
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(
            DEFAULT_HISTORY,
            DEFAULT_SAMPLE_INTERVAL,
            ResourceThresholds::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_admission_thresholds() {
        assert!(ResourceMonitor::can_admit_managed(799, 1000));
        assert!(!ResourceMonitor::can_admit_managed(800, 1000));
        assert!(!ResourceMonitor::is_critical_managed(900, 1000));
        assert!(ResourceMonitor::is_critical_managed(901, 1000));
    }

    #[test]
    fn empty_monitor_has_no_prediction() {
        let monitor = ResourceMonitor::default();
        assert_eq!(monitor.predict_memory_exhaustion(), None);
        assert_eq!(monitor.current_usage(), None);
        assert_eq!(monitor.average_usage(60), None);
    }

    #[test]
    fn predicts_exhaustion_from_a_short_rising_trend() {
        let mut monitor = ResourceMonitor::default();
        let base = SystemTime::now();
        monitor.history.push_back(ResourceUsage {
            timestamp: Some(base),
            total_memory_mb: 1000,
            used_memory_mb: 100,
            ..Default::default()
        });
        monitor.history.push_back(ResourceUsage {
            timestamp: Some(base + Duration::from_secs(10)),
            total_memory_mb: 1000,
            used_memory_mb: 200,
            ..Default::default()
        });
        assert!(monitor.predict_memory_exhaustion().is_some());
    }

    #[test]
    fn sampling_populates_history_and_bounds_it() {
        let mut monitor = ResourceMonitor::new(2, Duration::from_millis(1), ResourceThresholds::default());
        monitor.sample();
        monitor.sample();
        monitor.sample();
        assert!(monitor.history.len() <= 2);
        assert!(monitor.current_usage().is_some());
    }
}
