//! Crate-wide error type.
//!
//! Mirrors the error kinds of the error-handling design: most variants carry enough
//! context to be logged and attributed to a single task without unwinding the whole
//! campaign. [`Error::MetricParse`] in particular is expected to be caught at the call
//! site and turned into a logged warning plus a default sample, never propagated.

use std::path::PathBuf;

use crate::task::TaskId;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid task {name:?}: {reason}")]
    InvalidTask { name: String, reason: String },

    #[error("setup invalid for task {task:?}: {reason}")]
    SetupInvalid { task: TaskId, reason: String },

    #[error("failed to spawn process for task {task:?}: {source}")]
    Spawn {
        task: TaskId,
        #[source]
        source: std::io::Error,
    },

    #[error("task {task:?} exited abnormally: {detail}")]
    AbnormalExit { task: TaskId, detail: String },

    #[error("constraint violation for task {task:?}: {message}")]
    ConstraintViolation { task: TaskId, message: String },

    #[error("failed to parse metrics from {}: {reason}", path.display())]
    MetricParse { path: PathBuf, reason: String },

    #[error("adapter error for task {task:?}: {reason}")]
    Adapter { task: TaskId, reason: String },

    #[error("unsupported fuzzer kind {kind:?}; available: {}", available.join(", "))]
    UnsupportedFuzzer { kind: String, available: Vec<String> },

    #[error("no process handle for task {0:?}")]
    NoSuchHandle(TaskId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}
