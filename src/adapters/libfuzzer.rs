//! LibFuzzer adapter: command shape, log-tail status-line parsing, and
//! best-effort corpus merge (spec.md §4.2, SUPPLEMENT-3).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use crate::metrics::{FuzzingMetrics, MetricProvider};
use crate::task::Task;

use super::{corpus_size, find_crashes, CapabilitySet, CrashAnalysis, FuzzerAdapter, PostProcessResult};

/// Adapter for libFuzzer-style in-process binaries. Stateless: the target
/// binary path is passed into each call, not stored.
#[derive(Default)]
pub struct LibFuzzerAdapter;

impl FuzzerAdapter for LibFuzzerAdapter {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            coverage_guided: true,
            parallel: true,
            dictionary: true,
            persistent: true,
            custom_mutators: true,
            requires_source: true,
            requires_instrumentation: true,
            crash_analysis: true,
            supports_timeout: true,
        }
    }

    fn build_command(&self, task: &Task, binary_path: &Path, work_dir: &Path) -> Vec<String> {
        let corpus_dir = task
            .paths
            .corpus_dir
            .clone()
            .unwrap_or_else(|| work_dir.join("corpus"));
        let _ = fs::create_dir_all(&corpus_dir);

        let mut cmd = vec![binary_path.display().to_string(), corpus_dir.display().to_string()];

        if let Some(seed_dir) = &task.paths.seed_dir {
            if seed_dir.exists() {
                cmd.push(seed_dir.display().to_string());
            }
        }

        let config = &task.fuzzer_config;
        if let Some(timeout) = task.resources.timeout_seconds {
            cmd.push(format!("-max_total_time={timeout}"));
        }
        if let Some(max_len) = config.get("max_len").and_then(|v| v.as_u64()) {
            cmd.push(format!("-max_len={max_len}"));
        }
        if let Some(runs) = config.get("runs").and_then(|v| v.as_u64()) {
            if runs > 0 {
                cmd.push(format!("-runs={runs}"));
            }
        }
        if let Some(mem) = task.resources.memory_limit_mb {
            cmd.push(format!("-rss_limit_mb={mem}"));
        }
        if let Some(dict) = config.get("dictionary").and_then(|v| v.as_str()) {
            cmd.push(format!("-dict={dict}"));
        }
        if let Some(workers) = config.get("workers").and_then(|v| v.as_u64()) {
            cmd.push(format!("-workers={workers}"));
            cmd.push(format!("-jobs={workers}"));
        }
        if config.get("only_ascii").and_then(|v| v.as_bool()).unwrap_or(false) {
            cmd.push("-only_ascii=1".into());
        }
        if config
            .get("reduce_inputs")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
        {
            cmd.push("-reduce_inputs=1".into());
        }
        if config
            .get("minimize_crash")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
        {
            cmd.push("-minimize_crash=1".into());
        }

        let artifact_dir = work_dir.join("artifacts");
        let _ = fs::create_dir_all(&artifact_dir);
        cmd.push(format!("-artifact_prefix={}/", artifact_dir.display()));

        let verbosity = config.get("verbosity").and_then(|v| v.as_u64()).unwrap_or(1);
        if verbosity > 0 {
            cmd.push(format!("-verbosity={verbosity}"));
        }
        if config.get("print_stats").and_then(|v| v.as_bool()).unwrap_or(false) {
            cmd.push("-print_stats=1".into());
        }

        cmd
    }

    fn metric_provider(&self, work_dir: &Path, _task: &Task) -> Box<dyn MetricProvider> {
        Box::new(LibFuzzerMetricProvider::new(work_dir.join("fuzzer.log")))
    }

    fn validate_setup(&self, binary_path: &Path, work_dir: &Path) -> std::result::Result<(), String> {
        if !binary_path.exists() {
            return Err(format!("binary not found: {}", binary_path.display()));
        }
        let output = Command::new(binary_path)
            .arg("-help=1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| format!("failed to validate binary: {e}"))?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !combined.contains("libFuzzer") {
            return Err("binary does not appear to be built with libFuzzer".into());
        }
        fs::create_dir_all(work_dir.join("corpus")).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn prepare_corpus(&self, seed_dir: &Path, corpus_dir: &Path, task: &Task) -> crate::Result<()> {
        if seed_dir.exists() && seed_dir != corpus_dir {
            fs::create_dir_all(corpus_dir)?;
            for entry in fs::read_dir(seed_dir)?.filter_map(|e| e.ok()) {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    fs::copy(entry.path(), corpus_dir.join(entry.file_name()))?;
                }
            }
        }
        if task
            .fuzzer_config
            .get("merge_corpus")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            self.merge_corpus(corpus_dir, task);
        }
        Ok(())
    }

    fn analyze_crash(&self, crash_file: &Path, binary_path: &Path, _work_dir: &Path) -> CrashAnalysis {
        let file_size = fs::metadata(crash_file).map(|m| m.len()).unwrap_or(0);
        let output = Command::new(binary_path).arg(crash_file).output();

        let crash_type = output.ok().and_then(|out| {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if stderr.contains("ERROR: AddressSanitizer") {
                Some("ASAN".to_string())
            } else if stderr.contains("ERROR: MemorySanitizer") {
                Some("MSAN".to_string())
            } else if stderr.contains("ERROR: UndefinedBehaviorSanitizer") {
                Some("UBSAN".to_string())
            } else if stderr.contains("ERROR: ThreadSanitizer") {
                Some("TSAN".to_string())
            } else {
                None
            }
        });

        CrashAnalysis {
            crash_file: crash_file.to_path_buf(),
            file_size,
            crash_type,
            fields: HashMap::new(),
        }
    }

    fn environment(&self, task: &Task) -> HashMap<String, String> {
        let config = &task.fuzzer_config;
        let mut env = HashMap::new();
        env.insert(
            "ASAN_OPTIONS".into(),
            config
                .get("asan_options")
                .and_then(|v| v.as_str())
                .unwrap_or("abort_on_error=1:symbolize=1:detect_leaks=0")
                .to_string(),
        );
        env.insert(
            "UBSAN_OPTIONS".into(),
            config
                .get("ubsan_options")
                .and_then(|v| v.as_str())
                .unwrap_or("halt_on_error=1:abort_on_error=1:symbolize=1")
                .to_string(),
        );
        if let Some(msan) = config.get("msan_options").and_then(|v| v.as_str()) {
            env.insert("MSAN_OPTIONS".into(), msan.to_string());
        }
        env
    }

    fn post_process(&self, work_dir: &Path, _task: &Task) -> PostProcessResult {
        PostProcessResult {
            crashes: find_crashes(work_dir),
            corpus_size: corpus_size(work_dir),
        }
    }
}

impl LibFuzzerAdapter {
    /// Runs the target binary itself with `-merge=1` (spec.md SUPPLEMENT-3);
    /// best-effort, never fails the task.
    fn merge_corpus(&self, corpus_dir: &Path, task: &Task) {
        log::info!("merging corpus at {}", corpus_dir.display());
        let Some(parent) = corpus_dir.parent() else {
            log::warn!("corpus dir has no parent, skipping merge");
            return;
        };
        let merged_dir = parent.join("corpus_merged");
        if fs::create_dir_all(&merged_dir).is_err() {
            return;
        }
        let Some((program, args)) = task.command.split_first() else {
            return;
        };

        let status = Command::new(program)
            .args(args)
            .arg("-merge=1")
            .arg(&merged_dir)
            .arg(corpus_dir)
            .status();

        match status {
            Ok(s) if s.success() => {
                if fs::remove_dir_all(corpus_dir).is_ok() && fs::rename(&merged_dir, corpus_dir).is_ok() {
                    log::info!("corpus merged successfully");
                } else {
                    log::warn!("merged corpus produced but swap failed");
                }
            }
            _ => log::warn!("corpus merge failed, leaving corpus untouched"),
        }
    }
}

/// Scans the tail of the fuzzer log for the status line
/// `#<execs> ... cov: <N> ft: <M> corp: <K>/... exec/s: <R>` (spec.md §4.2).
struct LibFuzzerMetricProvider {
    log_file: PathBuf,
    last_coverage_branches: u64,
    last_new_coverage_time: SystemTime,
}

impl LibFuzzerMetricProvider {
    fn new(log_file: PathBuf) -> Self {
        Self {
            log_file,
            last_coverage_branches: 0,
            last_new_coverage_time: SystemTime::now(),
        }
    }

    fn parse_status_line(line: &str) -> Option<(u64, u64, u64, u64, f64)> {
        let execs = extract_after(line, '#')?;
        let cov = extract_labeled(line, "cov:")?;
        let ft = extract_labeled(line, "ft:")?;
        let corp = extract_labeled_ratio(line, "corp:")?;
        let rate = extract_labeled_f64(line, "exec/s:")?;
        Some((execs, cov, ft, corp, rate))
    }
}

fn extract_after(line: &str, marker: char) -> Option<u64> {
    let idx = line.find(marker)?;
    line[idx + 1..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn extract_labeled(line: &str, label: &str) -> Option<u64> {
    let idx = line.find(label)?;
    line[idx + label.len()..].trim_start().split_whitespace().next()?.parse().ok()
}

fn extract_labeled_f64(line: &str, label: &str) -> Option<f64> {
    let idx = line.find(label)?;
    line[idx + label.len()..].trim_start().split_whitespace().next()?.parse().ok()
}

fn extract_labeled_ratio(line: &str, label: &str) -> Option<u64> {
    let idx = line.find(label)?;
    let token = line[idx + label.len()..].trim_start().split_whitespace().next()?;
    token.split('/').next()?.parse().ok()
}

impl MetricProvider for LibFuzzerMetricProvider {
    fn collect(&mut self) -> FuzzingMetrics {
        let Ok(contents) = fs::read_to_string(&self.log_file) else {
            return FuzzingMetrics::default().stamped();
        };

        let lines: Vec<&str> = contents.lines().collect();
        let tail: &[&str] = if lines.len() > 100 {
            &lines[lines.len() - 100..]
        } else {
            &lines
        };

        let mut metrics = FuzzingMetrics::default();
        for line in tail.iter().rev() {
            if let Some((execs, cov, ft, corp, rate)) = Self::parse_status_line(line) {
                metrics.total_executions = execs;
                metrics.coverage_branches = cov;
                metrics.total_paths = ft;
                metrics.corpus_size = corp;
                metrics.executions_per_second = rate;
                break;
            }
        }

        metrics.unique_crashes = tail
            .iter()
            .filter(|l| l.contains("ERROR:") || l.contains("SUMMARY:"))
            .count() as u64;

        if metrics.coverage_branches > self.last_coverage_branches {
            self.last_new_coverage_time = SystemTime::now();
        }
        self.last_coverage_branches = metrics.coverage_branches;
        metrics.timestamp = Some(SystemTime::now());
        metrics
    }

    fn is_stalled(&self, threshold_seconds: u64) -> bool {
        self.last_new_coverage_time
            .elapsed()
            .map(|d| d >= Duration::from_secs(threshold_seconds))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_status_line() {
        let line = "#12345 NEW    cov: 1234 ft: 5678 corp: 42/1024Kb exec/s: 1000";
        let parsed = LibFuzzerMetricProvider::parse_status_line(line).unwrap();
        assert_eq!(parsed, (12345, 1234, 5678, 42, 1000.0));
    }

    #[test]
    fn collects_from_log_tail() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("fuzzer.log");
        fs::write(
            &log_path,
            "#100 INITED cov: 10 ft: 20 corp: 1/1b exec/s: 50\n\
             #500 NEW    cov: 55 ft: 80 corp: 5/500b exec/s: 900\n",
        )
        .unwrap();

        let mut provider = LibFuzzerMetricProvider::new(log_path);
        let metrics = provider.collect();
        assert_eq!(metrics.total_executions, 500);
        assert_eq!(metrics.coverage_branches, 55);
        assert_eq!(metrics.total_paths, 80);
        assert_eq!(metrics.corpus_size, 5);
    }

    #[test]
    fn detects_sanitizer_crash_markers() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("fuzzer.log");
        fs::write(&log_path, "ERROR: AddressSanitizer: heap-buffer-overflow\n").unwrap();

        let mut provider = LibFuzzerMetricProvider::new(log_path);
        let metrics = provider.collect();
        assert_eq!(metrics.unique_crashes, 1);
    }
}
