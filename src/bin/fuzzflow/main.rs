mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::TERM_SIGNALS;

use fuzzflow::adapters::AdapterRegistry;
use fuzzflow::config::{OrchestratorConfig, TaskFile};
use fuzzflow::orchestrator::Orchestrator;

fn main() {
    env_logger::init();

    let cli = cli::Cli::parse();
    let code = match cli.command {
        cli::Command::Run {
            config,
            tasks,
            max_parallel,
            memory_limit_mb,
            cpu_limit_percent,
            output,
            debug,
        } => run(config, tasks, max_parallel, memory_limit_mb, cpu_limit_percent, output, debug),
        cli::Command::Create { output } => create(output),
        cli::Command::ListFuzzers => list_fuzzers(),
        cli::Command::Validate { file } => validate(file),
    };
    std::process::exit(code);
}

fn run(
    config_path: Option<PathBuf>,
    tasks_path: PathBuf,
    max_parallel: usize,
    memory_limit_mb: Option<u64>,
    cpu_limit_percent: Option<f64>,
    output: PathBuf,
    debug: bool,
) -> i32 {
    if debug {
        log::set_max_level(log::LevelFilter::Debug);
    }

    let mut config = match config_path {
        Some(path) => match load_orchestrator_config(&path) {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to load config: {e}");
                return 2;
            }
        },
        None => OrchestratorConfig::default(),
    };
    config.max_parallel_tasks = max_parallel;
    config.memory_limit_mb = memory_limit_mb.or(config.memory_limit_mb);
    config.cpu_limit_percent = cpu_limit_percent.or(config.cpu_limit_percent);
    config.output_dir = output.to_string_lossy().to_string();

    let task_file = match TaskFile::load(&tasks_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("failed to load task file: {e}");
            return 2;
        }
    };
    let tasks = match task_file.into_tasks() {
        Ok(tasks) => tasks,
        Err(e) => {
            log::error!("invalid task file: {e}");
            return 2;
        }
    };

    let scheduling_interval = Duration::from_secs_f64(config.scheduling_interval_seconds);
    let orchestrator = Orchestrator::new(config, AdapterRegistry::default());

    for task in tasks {
        let name = task.name.clone();
        if let Err(e) = orchestrator.submit_task(task) {
            log::error!("failed to submit task {name}: {e}");
            return 2;
        }
    }

    let shutting_down = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        if signal_hook::flag::register(*sig, Arc::clone(&shutting_down)).is_err() {
            log::warn!("failed to register signal handler for {sig}");
        }
    }

    while orchestrator.has_pending() {
        if shutting_down.load(Ordering::SeqCst) {
            log::info!("shutdown signal received, stopping campaign");
            orchestrator.stop_all();
            break;
        }
        orchestrator.tick();
        std::thread::sleep(scheduling_interval);
    }
    orchestrator.stop_all();

    let stats = orchestrator.statistics();
    log::info!(
        "campaign finished: {} completed, {} failed",
        stats.tasks_completed,
        stats.tasks_failed
    );
    if stats.tasks_failed > 0 {
        1
    } else {
        0
    }
}

fn create(output: PathBuf) -> i32 {
    let starter = r#"{
  "version": "2.0",
  "tasks": [
    {
      "name": "example-afl",
      "command": ["afl-fuzz", "-i", "seeds", "-o", "output", "--", "./target", "@@"],
      "fuzzer_type": "afl",
      "priority": "NORMAL",
      "memory_limit_mb": 2048,
      "tags": ["example"]
    }
  ]
}
"#;
    match std::fs::write(&output, starter) {
        Ok(()) => {
            log::info!("wrote starter tasks file to {}", output.display());
            0
        }
        Err(e) => {
            log::error!("failed to write {}: {e}", output.display());
            2
        }
    }
}

fn list_fuzzers() -> i32 {
    let registry = AdapterRegistry::default();
    for kind in registry.list() {
        println!("{kind}");
    }
    0
}

fn validate(file: PathBuf) -> i32 {
    match TaskFile::load(&file).and_then(|f| f.validate()) {
        Ok(()) => {
            println!("{}: ok", file.display());
            0
        }
        Err(e) => {
            eprintln!("{}: {e}", file.display());
            1
        }
    }
}

fn load_orchestrator_config(path: &PathBuf) -> fuzzflow::Result<OrchestratorConfig> {
    let contents = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
            .map_err(|e| fuzzflow::Error::Config(format!("invalid YAML config: {e}"))),
        _ => serde_json::from_str(&contents)
            .map_err(|e| fuzzflow::Error::Config(format!("invalid JSON config: {e}"))),
    }
}
