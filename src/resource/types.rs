//! The host snapshot record and the threshold set alert callbacks are compared
//! against.

use std::time::SystemTime;

/// Timestamped host snapshot (spec.md §3). A bounded ring of the last *H*
/// samples (default 300) is retained by [`super::ResourceMonitor`].
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub timestamp: Option<SystemTime>,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub available_memory_mb: u64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub per_core_cpu_percent: Vec<f64>,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Alert thresholds checked against each new sample.
#[derive(Debug, Clone, Copy)]
pub struct ResourceThresholds {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_percent: 90.0,
            cpu_percent: 95.0,
            disk_percent: 90.0,
        }
    }
}
