//! Per-fuzzer translation: command construction, corpus prep, stats parsing,
//! crash analysis (spec.md §4.2), grounded on the original adapter hierarchy
//! (`examples/original_source/src/fuzzflow/adapters/{base,afl,libfuzzer,registry}.py`).

mod afl;
mod libfuzzer;
mod registry;

pub use registry::AdapterRegistry;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::metrics::MetricProvider;
use crate::task::Task;
use crate::Result;

/// Static capability declaration (spec.md §3, `Adapter`). `supports_timeout` is
/// carried from the original `FuzzerCapabilities` dataclass even though spec.md
/// §4.2 doesn't list it among the capability set it enumerates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilitySet {
    pub coverage_guided: bool,
    pub parallel: bool,
    pub dictionary: bool,
    pub persistent: bool,
    pub custom_mutators: bool,
    pub requires_source: bool,
    pub requires_instrumentation: bool,
    pub crash_analysis: bool,
    pub supports_timeout: bool,
}

/// Best-effort post-mortem result for one crash artifact.
#[derive(Debug, Clone, Default)]
pub struct CrashAnalysis {
    pub crash_file: PathBuf,
    pub file_size: u64,
    pub crash_type: Option<String>,
    pub fields: HashMap<String, String>,
}

/// What `postProcess` reports back to the orchestrator (spec.md §4.8).
#[derive(Debug, Clone, Default)]
pub struct PostProcessResult {
    pub crashes: Vec<PathBuf>,
    pub corpus_size: usize,
}

/// Contract every fuzzer adapter implements (spec.md §4.2). Adapters hold no
/// mutable state beyond the binary path they were constructed with.
pub trait FuzzerAdapter: Send + Sync {
    fn capabilities(&self) -> CapabilitySet;

    /// Deterministic, side-effect free: produces the final OS command line.
    fn build_command(&self, task: &Task, binary_path: &Path, work_dir: &Path) -> Vec<String>;

    fn metric_provider(&self, work_dir: &Path, task: &Task) -> Box<dyn MetricProvider>;

    /// Preflight check; must not block more than a few seconds and must not
    /// start the fuzzer. Returns a human-readable reason on failure; the caller
    /// (the orchestrator) attributes it to the task being set up.
    fn validate_setup(&self, binary_path: &Path, work_dir: &Path) -> std::result::Result<(), String>;

    /// Seeds the working corpus; may invoke an adapter-specific minimization
    /// tool if configured (spec.md §4.2, SUPPLEMENT-2/3).
    fn prepare_corpus(&self, seed_dir: &Path, corpus_dir: &Path, task: &Task) -> Result<()>;

    fn analyze_crash(&self, crash_file: &Path, binary_path: &Path, work_dir: &Path) -> CrashAnalysis;

    /// Environment variables merged into the child's environment.
    fn environment(&self, task: &Task) -> HashMap<String, String>;

    fn post_process(&self, work_dir: &Path, task: &Task) -> PostProcessResult;
}

/// Shared crash-directory / corpus-directory discovery used by both adapters,
/// mirroring `FuzzerAdapter.find_crashes`/`get_corpus_size` in the original.
pub(crate) fn find_crashes(work_dir: &Path) -> Vec<PathBuf> {
    let mut crashes = Vec::new();
    for dir_name in ["crashes", "crash", "failures"] {
        let dir = work_dir.join(dir_name);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            crashes.extend(entries.filter_map(|e| e.ok()).map(|e| e.path()));
        }
    }
    crashes
}

pub(crate) fn corpus_size(work_dir: &Path) -> usize {
    for dir_name in ["corpus", "queue", "inputs"] {
        let dir = work_dir.join(dir_name);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            return entries.filter_map(|e| e.ok()).count();
        }
    }
    0
}

/// Parses a crash filename of the form `id:NNNNNN,sig:NN,src:...,op:...,pos:...`
/// into key/value fields (spec.md §4.2).
pub(crate) fn parse_crash_filename(name: &str) -> HashMap<String, String> {
    name.split(',')
        .filter_map(|part| part.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
