//! Execution sandbox for generated scripts.
//!
//! Each attempt runs as a child process in its own working directory:
//!
//! ```text
//! <workspace>/<run_id>/attempt-<n>/pipeline.py
//! ```
//!
//! The runner only captures what the process did (exit code, streams,
//! whether it was killed for running too long). Interpreting the output is
//! the job of [`crate::report`] and [`crate::classifier`].
//!
//! # Example
//!
//! ```ignore
//! use automl_forge::runner::{ProcessSandbox, SandboxConfig, ScriptExecutor, ScriptJob};
//! use tokio_util::sync::CancellationToken;
//!
//! let sandbox = ProcessSandbox::new(SandboxConfig::new("python3", "./runs"));
//! let job = ScriptJob::new("run-1", 1, "print('hi')");
//! let output = sandbox.execute(&job, &CancellationToken::new(), None).await?;
//! assert_eq!(output.exit_code, Some(0));
//! ```

pub mod result;
pub mod sandbox;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use result::ExecutionOutput;
pub use sandbox::{ProcessSandbox, SandboxConfig, SandboxError};

/// One script to execute.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    /// Pipeline run this attempt belongs to; names the working directory.
    pub run_id: String,
    /// 1-based attempt index.
    pub attempt: u32,
    /// Script source.
    pub code: String,
}

impl ScriptJob {
    pub fn new(run_id: impl Into<String>, attempt: u32, code: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            attempt,
            code: code.into(),
        }
    }
}

/// Runs a script to completion, timeout or cancellation.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Executes `job`.
    ///
    /// Stdout lines are forwarded to `lines` as they arrive, when given.
    /// A timeout is reported through `ExecutionOutput::timed_out`; a
    /// cancellation kills the child and returns `SandboxError::Cancelled`.
    async fn execute(
        &self,
        job: &ScriptJob,
        cancel: &CancellationToken,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ExecutionOutput, SandboxError>;

    /// Removes everything the executions of `run_id` left on disk.
    async fn cleanup(&self, _run_id: &str) -> Result<(), SandboxError> {
        Ok(())
    }
}
