//! The command line interface of the orchestrator.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(about = "Resource-aware orchestrator for long-running fuzzing campaigns")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a campaign from a task file.
    Run {
        #[arg(long = "config")]
        config: Option<PathBuf>,

        #[arg(long = "tasks", required = true)]
        tasks: PathBuf,

        #[arg(long = "max-parallel", default_value = "10")]
        max_parallel: usize,

        #[arg(long = "memory-limit")]
        memory_limit_mb: Option<u64>,

        #[arg(long = "cpu-limit")]
        cpu_limit_percent: Option<f64>,

        #[arg(long = "output", default_value = "./out")]
        output: PathBuf,

        #[arg(long = "debug", default_value = "false")]
        debug: bool,
    },

    /// Emit a starter tasks file.
    Create {
        #[arg(long = "output", default_value = "tasks.json")]
        output: PathBuf,
    },

    /// Enumerate registered adapter kinds.
    ListFuzzers,

    /// Syntactic + semantic check of a tasks file.
    Validate {
        #[arg(name = "FILE")]
        file: PathBuf,
    },
}
