//! Host and process-tree resource sampling (spec.md §4.4), backed by `sysinfo`.

mod monitor;
mod types;

pub use monitor::ResourceMonitor;
pub use types::{ResourceThresholds, ResourceUsage};
