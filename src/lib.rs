//! fuzzflow: a resource-aware orchestrator for long-running fuzzing campaigns.
//!
//! Runs many fuzzer processes (AFL-family, libFuzzer) concurrently under a
//! scheduling strategy, enforces memory/CPU/time constraints on the running
//! set, and tracks per-task fuzzing metrics to guide prioritization.

pub mod adapters;
pub mod config;
pub mod constraints;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod process;
pub mod resource;
pub mod scheduler;
pub mod task;

pub use error::{Error, Result};
