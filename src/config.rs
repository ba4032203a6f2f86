//! Task file (JSON/YAML) loading and orchestrator configuration (spec.md §6),
//! grounded on the original `OrchestratorConfig` dataclass and task-file loader
//! (`examples/original_source/src/fuzzflow/orchestrator.py`).

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskBuilder, TaskId, TaskPriority};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_max_parallel() -> usize {
    10
}

fn default_scheduling_interval() -> f64 {
    5.0
}

fn default_cleanup_interval() -> f64 {
    60.0
}

fn default_metrics_interval() -> f64 {
    10.0
}

fn default_grace_seconds() -> u64 {
    30
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_stall_threshold_seconds() -> u64 {
    1800
}

fn default_efficiency_threshold() -> f64 {
    30.0
}

fn default_output_dir() -> String {
    "./out".to_string()
}

/// Mirrors the original's `OrchestratorConfig` dataclass fields and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_parallel_tasks: usize,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit_percent: Option<f64>,
    pub scheduling_interval_seconds: f64,
    pub cleanup_interval_seconds: f64,
    pub metrics_interval_seconds: f64,
    pub shutdown_grace_seconds: u64,
    pub enable_preemption: bool,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub kill_on_violation: bool,
    pub adaptive_scheduling: bool,
    pub stall_threshold_seconds: u64,
    pub efficiency_threshold: f64,
    pub output_dir: String,
    pub fair_share_weights: std::collections::HashMap<String, f64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel(),
            memory_limit_mb: None,
            cpu_limit_percent: None,
            scheduling_interval_seconds: default_scheduling_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            metrics_interval_seconds: default_metrics_interval(),
            shutdown_grace_seconds: default_grace_seconds(),
            enable_preemption: false,
            auto_restart: false,
            max_restart_attempts: default_max_restart_attempts(),
            kill_on_violation: false,
            adaptive_scheduling: false,
            stall_threshold_seconds: default_stall_threshold_seconds(),
            efficiency_threshold: default_efficiency_threshold(),
            output_dir: default_output_dir(),
            fair_share_weights: std::collections::HashMap::new(),
        }
    }
}

/// A single task entry in the on-disk task file, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFileEntry {
    pub name: String,
    pub command: CommandField,
    pub fuzzer_type: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub fuzzer_config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub seed_dir: Option<std::path::PathBuf>,
}

/// `command` accepts either a single shell-like string or a pre-tokenized
/// vector (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandField {
    Tokens(Vec<String>),
    Shell(String),
}

/// Top-level task file document, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub version: String,
    pub tasks: Vec<TaskFileEntry>,
}

impl TaskFile {
    /// Loads and parses a task file, dispatching on extension (`.yaml`/`.yml`
    /// vs everything else treated as JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid YAML task file: {e}"))),
            _ => serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid JSON task file: {e}"))),
        }
    }

    /// Validates required fields and dependency references without building
    /// any `Task`s; used by the `validate` CLI subcommand (spec.md §6).
    pub fn validate(&self) -> Result<()> {
        let names: HashSet<&str> = self.tasks.iter().map(|t| t.name.as_str()).collect();
        if names.len() != self.tasks.len() {
            return Err(Error::Config("duplicate task names in task file".into()));
        }
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(Error::Config("task name must not be empty".into()));
            }
            let command_empty = match &task.command {
                CommandField::Tokens(tokens) => tokens.is_empty(),
                CommandField::Shell(s) => s.trim().is_empty(),
            };
            if command_empty {
                return Err(Error::Config(format!("task {:?} has an empty command", task.name)));
            }
            if task.fuzzer_type.is_empty() {
                return Err(Error::Config(format!("task {:?} is missing fuzzer_type", task.name)));
            }
            for dep in &task.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(Error::Config(format!(
                        "task {:?} depends on unknown task {dep:?}",
                        task.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Builds `Task`s from the parsed entries, resolving name-based
    /// dependency references to the generated `TaskId`s.
    pub fn into_tasks(self) -> Result<Vec<Task>> {
        self.validate()?;
        let mut ids = std::collections::HashMap::new();
        for entry in &self.tasks {
            ids.insert(entry.name.clone(), TaskId::new());
        }
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for entry in self.tasks {
            let command = match entry.command {
                CommandField::Tokens(tokens) => tokens,
                CommandField::Shell(s) => Task::tokenize_command(&s)?,
            };
            let mut builder = TaskBuilder::new(entry.name.clone(), entry.fuzzer_type)
                .command_vec(command)
                .priority(entry.priority.unwrap_or_default())
                .tags(entry.tags)
                .fuzzer_config(entry.fuzzer_config);
            if let Some(mb) = entry.memory_limit_mb {
                builder = builder.memory_limit_mb(mb);
            }
            if let Some(cores) = entry.cpu_cores {
                builder = builder.cpu_cores(cores);
            }
            if let Some(timeout) = entry.timeout_seconds {
                builder = builder.timeout_seconds(timeout);
            }
            if let Some(seed_dir) = entry.seed_dir {
                builder = builder.seed_dir(seed_dir);
            }
            let deps: Vec<TaskId> = entry
                .dependencies
                .iter()
                .filter_map(|name| ids.get(name).copied())
                .collect();
            builder = builder.dependencies(deps);
            let mut task = builder.build();
            task.id = ids[&task.name];
            tasks.push(task);
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json_task_file() {
        let json = r#"{
            "version": "2.0",
            "tasks": [
                { "name": "t1", "command": ["afl-fuzz", "-i", "in", "-o", "out"], "fuzzer_type": "afl" }
            ]
        }"#;
        let parsed: TaskFile = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let json = r#"{
            "version": "2.0",
            "tasks": [
                { "name": "t1", "command": "afl-fuzz -i in -o out", "fuzzer_type": "afl",
                  "dependencies": ["missing"] }
            ]
        }"#;
        let parsed: TaskFile = serde_json::from_str(json).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn into_tasks_resolves_name_dependencies() {
        let json = r#"{
            "version": "2.0",
            "tasks": [
                { "name": "a", "command": "true", "fuzzer_type": "afl" },
                { "name": "b", "command": "true", "fuzzer_type": "afl", "dependencies": ["a"] }
            ]
        }"#;
        let parsed: TaskFile = serde_json::from_str(json).unwrap();
        let tasks = parsed.into_tasks().unwrap();
        let b = tasks.iter().find(|t| t.name == "b").unwrap();
        assert_eq!(b.dependencies.len(), 1);
    }

    #[test]
    fn shell_string_command_tokenizes() {
        let json = r#"{
            "version": "2.0",
            "tasks": [ { "name": "t1", "command": "afl-fuzz -i in -o out", "fuzzer_type": "afl" } ]
        }"#;
        let parsed: TaskFile = serde_json::from_str(json).unwrap();
        let tasks = parsed.into_tasks().unwrap();
        assert_eq!(tasks[0].command, vec!["afl-fuzz", "-i", "in", "-o", "out"]);
    }
}
