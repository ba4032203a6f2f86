//! AFL-family adapter: command shape, `fuzzer_stats` parsing, and best-effort
//! corpus minimization via `afl-cmin` (spec.md §4.2, SUPPLEMENT-2).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use crate::metrics::{FuzzingMetrics, MetricProvider};
use crate::task::Task;
use crate::Result;

use super::{
    corpus_size, find_crashes, parse_crash_filename, CapabilitySet, CrashAnalysis, FuzzerAdapter,
    PostProcessResult,
};

/// Adapter for AFL/AFL++-family fuzzers. Holds only the directory its `afl-fuzz`
/// and `afl-cmin` binaries live in.
pub struct AflAdapter {
    afl_dir: PathBuf,
}

impl AflAdapter {
    pub fn new(afl_dir: PathBuf) -> Self {
        Self { afl_dir }
    }

    fn stats_file(&self, task: &Task, output_dir: &Path) -> PathBuf {
        if let Some(fuzzer_id) = task.fuzzer_config.get("fuzzer_id").and_then(|v| v.as_str()) {
            output_dir.join(fuzzer_id).join("fuzzer_stats")
        } else {
            output_dir.join("master").join("fuzzer_stats")
        }
    }
}

impl Default for AflAdapter {
    fn default() -> Self {
        Self::new(PathBuf::from("/usr/local/bin"))
    }
}

impl FuzzerAdapter for AflAdapter {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            coverage_guided: true,
            parallel: true,
            dictionary: true,
            persistent: true,
            custom_mutators: true,
            requires_source: false,
            requires_instrumentation: true,
            crash_analysis: true,
            supports_timeout: true,
        }
    }

    fn build_command(&self, task: &Task, binary_path: &Path, work_dir: &Path) -> Vec<String> {
        let input_dir = task
            .paths
            .seed_dir
            .clone()
            .unwrap_or_else(|| work_dir.join("input"));
        let output_dir = work_dir.join("output");

        let mut cmd = vec![
            self.afl_dir.join("afl-fuzz").display().to_string(),
            "-i".into(),
            input_dir.display().to_string(),
            "-o".into(),
            output_dir.display().to_string(),
        ];

        if let Some(mem) = task.resources.memory_limit_mb {
            cmd.push("-m".into());
            cmd.push(mem.to_string());
        } else {
            cmd.push("-m".into());
            cmd.push("none".into());
        }

        if let Some(timeout) = task.resources.timeout_seconds {
            cmd.push("-t".into());
            cmd.push((timeout * 1000).to_string());
        }

        let config = &task.fuzzer_config;
        if let Some(dict) = config.get("dictionary").and_then(|v| v.as_str()) {
            cmd.push("-x".into());
            cmd.push(dict.into());
        }
        if let Some(mode) = config.get("mode").and_then(|v| v.as_str()) {
            cmd.push("-P".into());
            cmd.push(mode.into());
        }
        if config.get("skip_deterministic").and_then(|v| v.as_bool()).unwrap_or(false) {
            cmd.push("-d".into());
        }
        if let Some(cpu) = config.get("cpu_affinity").and_then(|v| v.as_u64()) {
            cmd.push("-b".into());
            cmd.push(cpu.to_string());
        }
        if let Some(fuzzer_id) = config.get("fuzzer_id").and_then(|v| v.as_str()) {
            cmd.push("-S".into());
            cmd.push(fuzzer_id.into());
        } else {
            cmd.push("-M".into());
            cmd.push("master".into());
        }
        if let Some(mutator) = config.get("custom_mutator").and_then(|v| v.as_str()) {
            cmd.push("-l".into());
            cmd.push(mutator.into());
        }
        if let Some(schedule) = config.get("power_schedule").and_then(|v| v.as_str()) {
            cmd.push("-p".into());
            cmd.push(schedule.into());
        }

        cmd.push("--".into());
        cmd.push(binary_path.display().to_string());
        if let Some(args) = config.get("binary_args").and_then(|v| v.as_array()) {
            cmd.extend(args.iter().filter_map(|v| v.as_str()).map(String::from));
        } else {
            cmd.push("@@".into());
        }
        cmd
    }

    fn metric_provider(&self, work_dir: &Path, task: &Task) -> Box<dyn MetricProvider> {
        let output_dir = work_dir.join("output");
        Box::new(AflMetricProvider::new(self.stats_file(task, &output_dir)))
    }

    fn validate_setup(&self, binary_path: &Path, work_dir: &Path) -> std::result::Result<(), String> {
        if !self.afl_dir.join("afl-fuzz").exists() {
            return Err(format!("afl-fuzz not found at {}", self.afl_dir.display()));
        }
        if !binary_path.exists() {
            return Err(format!("binary not found: {}", binary_path.display()));
        }
        let input_dir = work_dir.join("input");
        if !input_dir.exists() {
            fs::create_dir_all(&input_dir).map_err(|e| e.to_string())?;
            fs::write(input_dir.join("default"), b"TEST").map_err(|e| e.to_string())?;
            log::warn!("created default input in {}", input_dir.display());
        }
        if fs::read_dir(&input_dir)
            .map_err(|e| e.to_string())?
            .next()
            .is_none()
        {
            return Err(format!("no input files found in {}", input_dir.display()));
        }
        Ok(())
    }

    fn prepare_corpus(&self, seed_dir: &Path, corpus_dir: &Path, task: &Task) -> Result<()> {
        if seed_dir != corpus_dir {
            fs::create_dir_all(corpus_dir)?;
            for entry in fs::read_dir(seed_dir)?.filter_map(|e| e.ok()) {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    fs::copy(entry.path(), corpus_dir.join(entry.file_name()))?;
                }
            }
        }
        if task
            .fuzzer_config
            .get("minimize_corpus")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            self.minimize_corpus(corpus_dir, task);
        }
        Ok(())
    }

    fn analyze_crash(&self, crash_file: &Path, binary_path: &Path, _work_dir: &Path) -> CrashAnalysis {
        let file_size = fs::metadata(crash_file).map(|m| m.len()).unwrap_or(0);
        let fields = crash_file
            .file_name()
            .and_then(|n| n.to_str())
            .map(parse_crash_filename)
            .unwrap_or_default();

        let analyzer = self.afl_dir.join("afl-analyze");
        if analyzer.exists() {
            let _ = Command::new(&analyzer)
                .arg("-i")
                .arg(crash_file)
                .arg("--")
                .arg(binary_path)
                .arg("@@")
                .output();
        }

        CrashAnalysis {
            crash_file: crash_file.to_path_buf(),
            file_size,
            crash_type: None,
            fields,
        }
    }

    fn environment(&self, task: &Task) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let config = &task.fuzzer_config;
        if config.get("no_affinity").and_then(|v| v.as_bool()).unwrap_or(false) {
            env.insert("AFL_NO_AFFINITY".into(), "1".into());
        }
        if config.get("skip_crashes").and_then(|v| v.as_bool()).unwrap_or(false) {
            env.insert("AFL_SKIP_CRASHES".into(), "1".into());
        }
        if let Some(hang) = config.get("hang_timeout").and_then(|v| v.as_u64()) {
            env.insert("AFL_HANG_TMOUT".into(), hang.to_string());
        }
        if let Some(map_size) = config.get("map_size").and_then(|v| v.as_u64()) {
            env.insert("AFL_MAP_SIZE".into(), map_size.to_string());
        }
        if config.get("persistent_mode").and_then(|v| v.as_bool()).unwrap_or(false) {
            env.insert("AFL_PERSISTENT".into(), "1".into());
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

impl AflAdapter {
    /// Best-effort; never fails the task if minimization fails (spec.md
    /// SUPPLEMENT-2).
    fn minimize_corpus(&self, corpus_dir: &Path, task: &Task) {
        log::info!("minimizing corpus at {}", corpus_dir.display());
        let minimized_dir = match corpus_dir.parent() {
            Some(p) => p.join("corpus_minimized"),
            None => {
                log::warn!("corpus dir has no parent, skipping minimization");
                return;
            }
        };
        if fs::create_dir_all(&minimized_dir).is_err() {
            return;
        }

        let mut cmd = Command::new(self.afl_dir.join("afl-cmin"));
        cmd.arg("-i").arg(corpus_dir).arg("-o").arg(&minimized_dir);
        if let Some(mem) = task.resources.memory_limit_mb {
            cmd.arg("-m").arg(mem.to_string());
        }
        if let Some(timeout) = task.resources.timeout_seconds {
            cmd.arg("-t").arg((timeout * 1000).to_string());
        }
        cmd.arg("--").args(&task.command);

        match cmd.status() {
            Ok(status) if status.success() => {
                if fs::remove_dir_all(corpus_dir).is_ok() && fs::rename(&minimized_dir, corpus_dir).is_ok() {
                    log::info!("corpus minimized successfully");
                } else {
                    log::warn!("minimized corpus produced but swap failed");
                }
            }
            _ => log::warn!("corpus minimization failed, leaving corpus untouched"),
        }
    }
}

/// Parses `OUT/<instance>/fuzzer_stats` (spec.md §4.2).
struct AflMetricProvider {
    stats_file: PathBuf,
    last_paths: u64,
    last_path_time: SystemTime,
}

impl AflMetricProvider {
    fn new(stats_file: PathBuf) -> Self {
        Self {
            stats_file,
            last_paths: 0,
            last_path_time: SystemTime::now(),
        }
    }
}

impl MetricProvider for AflMetricProvider {
    fn collect(&mut self) -> FuzzingMetrics {
        let Ok(contents) = fs::read_to_string(&self.stats_file) else {
            return FuzzingMetrics::default().stamped();
        };

        let mut stats: HashMap<&str, &str> = HashMap::new();
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once(':') {
                stats.insert(key.trim(), value.trim());
            }
        }

        let get_f64 = |key: &str, default: f64| -> f64 {
            stats
                .get(key)
                .map(|v| v.trim_end_matches('%'))
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_u64 = |key: &str| -> u64 { stats.get(key).and_then(|v| v.parse().ok()).unwrap_or(0) };

        let total_paths = get_u64("paths_total");
        if self.last_paths != total_paths {
            self.last_paths = total_paths;
            self.last_path_time = SystemTime::now();
        }

        FuzzingMetrics {
            timestamp: Some(SystemTime::now()),
            coverage_percent: get_f64("bitmap_cvg", 0.0),
            coverage_branches: 0,
            total_executions: get_u64("execs_done"),
            executions_per_second: get_f64("execs_per_sec", 0.0),
            unique_crashes: get_u64("unique_crashes"),
            unique_hangs: get_u64("unique_hangs"),
            total_paths,
            corpus_size: get_u64("corpus_count"),
            corpus_favored: get_u64("corpus_favored"),
            stability_percent: get_f64("stability", 100.0),
        }
    }

    fn is_stalled(&self, threshold_seconds: u64) -> bool {
        self.last_path_time
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
    fn parses_fuzzer_stats_file() {
        let dir = tempdir().unwrap();
        let stats_path = dir.path().join("fuzzer_stats");
        fs::write(
            &stats_path,
            "bitmap_cvg   : 12.34%\n\
             execs_done   : 100000\n\
             execs_per_sec: 523.1\n\
             unique_crashes: 2\n\
             unique_hangs : 0\n\
             paths_total  : 57\n\
             corpus_count : 57\n\
             corpus_favored: 12\n\
             stability    : 98.50%\n",
        )
        .unwrap();

        let mut provider = AflMetricProvider::new(stats_path);
        let metrics = provider.collect();
        assert_eq!(metrics.total_executions, 100000);
        assert_eq!(metrics.unique_crashes, 2);
        assert_eq!(metrics.total_paths, 57);
        assert!((metrics.coverage_percent - 12.34).abs() < 1e-6);
        assert!((metrics.stability_percent - 98.50).abs() < 1e-6);
    }

    #[test]
    fn missing_stats_file_yields_zero_sample() {
        let mut provider = AflMetricProvider::new(PathBuf::from("/nonexistent/fuzzer_stats"));
        let metrics = provider.collect();
        assert_eq!(metrics.total_executions, 0);
    }
}
