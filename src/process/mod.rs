//! Process spawning, signal-based lifecycle control, and per-tree resource
//! sampling (spec.md §4.3), grounded on the teacher's forkserver's use of
//! `nix::sys::signal` (`src/executor/forkserver.rs`) and the original
//! `FuzzProcess` class (`examples/original_source/src/fuzzflow/core/process.py`).

mod handle;
mod supervisor;

pub use handle::{ProcessHandle, ProcessMetric, ProcessState};
pub use supervisor::ProcessSupervisor;
