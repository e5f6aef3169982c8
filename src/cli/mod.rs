//! Command-line interface for registry-loadgen.
//!
//! Provides the `run` driver, the `worker` entrypoint of job pods, and the
//! `plan` preview of a run's tags.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
