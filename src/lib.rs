//! automl-forge: LLM-driven generation, execution and repair of ML pipelines.
//!
//! This library turns a database schema and an algorithm choice into a
//! runnable Python pipeline script, executes it in an isolated child process,
//! and feeds classified failures back to the code generator until the script
//! emits a structured report or the retry budget is spent.

// Core modules
pub mod adapter;
pub mod analysis;
pub mod classifier;
pub mod cli;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod runner;
pub mod settings;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use error::{LlmError, RegistryError};
pub use pipeline::{PipelineOrchestrator, PipelineRequest, PipelineRun, StreamEvent, TerminalState};
pub use settings::{Settings, SettingsStore};
