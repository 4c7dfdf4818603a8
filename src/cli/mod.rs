//! Command-line interface for automl-forge.
//!
//! Provides commands for serving the HTTP API, running a single pipeline,
//! and inspecting recorded models and settings.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
