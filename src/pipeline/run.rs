//! Requests, attempts and run records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapter::{AlgorithmType, InitialContext, SchemaContext};
use crate::classifier::{AttemptOutcome, Evaluation, FailureDescriptor};
use crate::registry::ModelRecord;
use crate::report::ExecutionReport;
use crate::runner::ExecutionOutput;

/// One user request for a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub schema: SchemaContext,
    pub algorithm: AlgorithmType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eda_summary: Option<String>,
    /// Script to run as attempt 1 instead of asking the adapter.
    ///
    /// This is the manual-retry entry point: resuming an exhausted run with
    /// its last code starts a new run with a full attempt budget. Earlier
    /// attempts are intentionally not counted.
    #[serde(default, alias = "code", skip_serializing_if = "Option::is_none")]
    pub initial_code: Option<String>,
}

impl PipelineRequest {
    pub fn new(schema: SchemaContext, algorithm: AlgorithmType) -> Self {
        Self {
            schema,
            algorithm,
            objective: None,
            eda_summary: None,
            initial_code: None,
        }
    }

    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = Some(objective.into());
        self
    }

    pub fn with_eda_summary(mut self, summary: impl Into<String>) -> Self {
        self.eda_summary = Some(summary.into());
        self
    }

    pub fn with_initial_code(mut self, code: impl Into<String>) -> Self {
        self.initial_code = Some(code.into());
        self
    }

    /// Adapter context for the first attempt.
    pub fn initial_context(&self) -> InitialContext {
        InitialContext {
            schema: self.schema.clone(),
            algorithm: self.algorithm,
            objective: self.objective.clone(),
            eda_summary: self.eda_summary.clone(),
        }
    }

    /// Supplied resume code, if non-blank.
    pub fn resume_code(&self) -> Option<&str> {
        self.initial_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
    }
}

/// One execute-and-evaluate cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    /// 1-based position within the run.
    pub index: u32,
    /// Exact script text executed.
    pub code: String,
    /// `None` when the attempt was aborted before evaluation.
    pub outcome: Option<AttemptOutcome>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ExecutionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDescriptor>,
}

impl Attempt {
    /// Records an evaluated attempt.
    pub fn evaluated(index: u32, code: String, output: &ExecutionOutput, evaluation: &Evaluation) -> Self {
        Self {
            index,
            code,
            outcome: Some(evaluation.outcome),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            duration_ms: output.duration_ms,
            report: evaluation.report.clone(),
            failure: evaluation.failure.clone(),
        }
    }

    /// Records an attempt cut short by cancellation.
    pub fn aborted(index: u32, code: String) -> Self {
        Self {
            index,
            code,
            outcome: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
            duration_ms: 0,
            report: None,
            failure: None,
        }
    }

    /// Returns true if the attempt reached evaluation.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    ExhaustedRetries,
    /// The adapter call itself failed. Not retried within the budget.
    AdapterFailed,
    AbortedByCaller,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Succeeded => write!(f, "succeeded"),
            TerminalState::ExhaustedRetries => write!(f, "exhausted_retries"),
            TerminalState::AdapterFailed => write!(f, "adapter_failed"),
            TerminalState::AbortedByCaller => write!(f, "aborted_by_caller"),
        }
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Adapting,
    Executing,
    Evaluating,
    Fixing,
    Finished(TerminalState),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Finished(_))
    }

    /// Returns true if `next` may follow `self`.
    ///
    /// Cancellation may end the run from any live state.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Finished(_), _) => false,
            (_, Finished(TerminalState::AbortedByCaller)) => true,
            (Adapting, Executing) => true,
            (Adapting, Finished(TerminalState::AdapterFailed)) => true,
            (Executing, Evaluating) => true,
            (Evaluating, Finished(TerminalState::Succeeded)) => true,
            (Evaluating, Finished(TerminalState::ExhaustedRetries)) => true,
            (Evaluating, Fixing) => true,
            (Fixing, Adapting) => true,
            // A local quick fix skips the adapter.
            (Fixing, Executing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Adapting => write!(f, "adapting"),
            PipelineState::Executing => write!(f, "executing"),
            PipelineState::Evaluating => write!(f, "evaluating"),
            PipelineState::Fixing => write!(f, "fixing"),
            PipelineState::Finished(terminal) => write!(f, "{}", terminal),
        }
    }
}

/// The bounded sequence of attempts answering one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRun {
    /// Names the run's working directories.
    pub run_id: String,
    pub max_attempts: u32,
    pub attempts: Vec<Attempt>,
    pub terminal_state: TerminalState,
    /// Final failure summary, for runs that did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Registry entry written on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_record: Option<ModelRecord>,
}

impl PipelineRun {
    pub(crate) fn new(run_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            run_id: run_id.into(),
            max_attempts,
            attempts: Vec::new(),
            terminal_state: TerminalState::AbortedByCaller,
            summary: None,
            model_record: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.terminal_state == TerminalState::Succeeded
    }

    /// Attempts that reached evaluation.
    pub fn completed_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_complete()).count()
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Report of the successful attempt.
    pub fn report(&self) -> Option<&ExecutionReport> {
        self.attempts.iter().rev().find_map(|a| a.report.as_ref())
    }

    /// Code of the last attempt, the input for a manual retry.
    pub fn final_code(&self) -> Option<&str> {
        self.last_attempt().map(|a| a.code.as_str())
    }
}
