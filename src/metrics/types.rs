//! The per-sample metric record and the trait adapters implement to produce it.

use std::time::SystemTime;

/// One timestamped snapshot of a fuzzing task's progress (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct FuzzingMetrics {
    pub timestamp: Option<SystemTime>,
    pub coverage_percent: f64,
    pub coverage_branches: u64,
    pub total_executions: u64,
    pub executions_per_second: f64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub total_paths: u64,
    pub corpus_size: u64,
    pub corpus_favored: u64,
    pub stability_percent: f64,
}

impl FuzzingMetrics {
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(SystemTime::now());
        self
    }
}

/// Produced by a [`crate::adapters::FuzzerAdapter`] for one task's working
/// directory; polled on a timer by the [`crate::metrics::MetricsRegistry`].
pub trait MetricProvider: Send {
    /// Parses the fuzzer's current output into a metrics sample. Implementations
    /// must not fail the caller on malformed output — return a default/zero sample
    /// and log instead (spec.md §7, `MetricParseError` policy).
    fn collect(&mut self) -> FuzzingMetrics;

    /// True if the fuzzer's primary progress metric (paths or coverage, adapter's
    /// choice) has not improved for at least `threshold_seconds`.
    fn is_stalled(&self, threshold_seconds: u64) -> bool;
}
