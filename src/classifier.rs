//! Failure classification for executed attempts.
//!
//! Turns an [`ExecutionOutput`] into an [`Evaluation`]: the attempt outcome,
//! the report on success, and on failure a [`FailureDescriptor`]. The
//! descriptor is all the code adapter sees about a failure, so it is kept
//! short: a kind, one message, and the offending code line when a traceback
//! points into the script.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::report::{extract_report, ExecutionReport, ReportError};
use crate::runner::result::tail_lines;
use crate::runner::ExecutionOutput;

/// Message used for timed-out attempts.
pub const TIMEOUT_MESSAGE: &str = "execution exceeded time budget";

/// Message used when a script exits 0 without a report.
pub const MISSING_REPORT_MESSAGE: &str = "script ran but produced no structured result";

const TAIL_LINES: usize = 20;
const SNIPPET_CONTEXT: usize = 2;

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RuntimeFailure,
    TimeoutFailure,
    NoReportFailure,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::RuntimeFailure => write!(f, "runtime_failure"),
            AttemptOutcome::TimeoutFailure => write!(f, "timeout_failure"),
            AttemptOutcome::NoReportFailure => write!(f, "no_report_failure"),
        }
    }
}

/// Kind of failure, as seen by the repair step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RuntimeError,
    MissingReport,
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::RuntimeError => write!(f, "runtime_error"),
            FailureKind::MissingReport => write!(f, "missing_report"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Offending script fragment located from a traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippet {
    /// 1-based line number in the script.
    pub line: usize,
    /// The line with a little surrounding context, `>` marking the culprit.
    pub text: String,
}

/// Structured description of why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<CodeSnippet>,
}

impl FailureDescriptor {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            snippet: None,
        }
    }

    /// Plain-text rendering used in prompts and fallback summaries.
    pub fn render(&self) -> String {
        let mut text = format!("[{}] {}", self.kind, self.message);
        if let Some(snippet) = &self.snippet {
            text.push_str(&format!("\nAt line {}:\n{}", snippet.line, snippet.text));
        }
        text
    }
}

impl fmt::Display for FailureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of evaluating one execution.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: AttemptOutcome,
    pub report: Option<ExecutionReport>,
    pub failure: Option<FailureDescriptor>,
}

/// Classifies execution results for a script with a known file name.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    script_name: String,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new("pipeline.py")
    }
}

fn frame_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("Invalid regex for traceback frames")
    })
}

fn exception_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][\w.]*(Error|Exception|Exit|Interrupt|Warning)\b(:.*)?$")
            .expect("Invalid regex for exception lines")
    })
}

impl FailureClassifier {
    pub fn new(script_name: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
        }
    }

    /// Decides the outcome of an attempt.
    ///
    /// A timeout is always a failure. Otherwise a well-formed report means
    /// success regardless of exit code; without one, exit 0 is a missing
    /// report and anything else a runtime failure.
    pub fn evaluate(&self, output: &ExecutionOutput, code: &str) -> Evaluation {
        if output.timed_out {
            return Evaluation {
                outcome: AttemptOutcome::TimeoutFailure,
                report: None,
                failure: Some(self.classify(output, code, None)),
            };
        }

        match extract_report(&output.stdout) {
            Ok(report) => {
                if !output.exited_cleanly() {
                    tracing::warn!(
                        exit_code = %output.exit_label(),
                        "Script printed a valid report but exited with failure, accepting report"
                    );
                }
                Evaluation {
                    outcome: AttemptOutcome::Success,
                    report: Some(report),
                    failure: None,
                }
            }
            Err(err) => {
                let outcome = if output.exit_code == Some(0) {
                    AttemptOutcome::NoReportFailure
                } else {
                    AttemptOutcome::RuntimeFailure
                };
                Evaluation {
                    outcome,
                    report: None,
                    failure: Some(self.classify(output, code, Some(&err))),
                }
            }
        }
    }

    /// Builds the failure descriptor for a failed execution.
    pub fn classify(
        &self,
        output: &ExecutionOutput,
        code: &str,
        report_error: Option<&ReportError>,
    ) -> FailureDescriptor {
        if output.timed_out {
            let tail = tail_lines(&output.stdout, TAIL_LINES);
            let message = if tail.trim().is_empty() {
                TIMEOUT_MESSAGE.to_string()
            } else {
                format!("{}\nLast output:\n{}", TIMEOUT_MESSAGE, tail)
            };
            return FailureDescriptor::new(FailureKind::Timeout, message);
        }

        if output.exit_code != Some(0) {
            if let Some(exception) = last_exception_line(&output.stderr) {
                return FailureDescriptor {
                    kind: FailureKind::RuntimeError,
                    message: exception,
                    snippet: self.locate_snippet(&output.stderr, code),
                };
            }
        } else {
            let message = match report_error {
                Some(ReportError::NotFound) | None => MISSING_REPORT_MESSAGE.to_string(),
                Some(err) => format!("{} ({})", MISSING_REPORT_MESSAGE, err),
            };
            return FailureDescriptor::new(FailureKind::MissingReport, message);
        }

        let tail = tail_lines(&output.stderr, TAIL_LINES);
        let message = if tail.trim().is_empty() {
            format!("process exited with code {} and no error output", output.exit_label())
        } else {
            tail
        };
        FailureDescriptor::new(FailureKind::Unknown, message)
    }

    /// Finds the innermost traceback frame inside the script and quotes it.
    fn locate_snippet(&self, stderr: &str, code: &str) -> Option<CodeSnippet> {
        let line = frame_regex()
            .captures_iter(stderr)
            .filter(|caps| {
                caps.get(1)
                    .map(|file| file.as_str().ends_with(self.script_name.as_str()))
                    .unwrap_or(false)
            })
            .filter_map(|caps| caps.get(2)?.as_str().parse::<usize>().ok())
            .last()?;

        let lines: Vec<&str> = code.lines().collect();
        if line == 0 || line > lines.len() {
            return None;
        }

        let first = line.saturating_sub(SNIPPET_CONTEXT).max(1);
        let last = (line + SNIPPET_CONTEXT).min(lines.len());
        let text = (first..=last)
            .map(|n| {
                let marker = if n == line { ">" } else { " " };
                format!("{} {:>4} | {}", marker, n, lines[n - 1])
            })
            .collect::<Vec<_>>()
            .join("\n");

        Some(CodeSnippet { line, text })
    }
}

/// Returns the last exception line of a Python-style traceback, if any.
fn last_exception_line(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr.lines().map(str::trim_end).collect();

    if let Some(line) = lines
        .iter()
        .rev()
        .find(|line| exception_regex().is_match(line.trim_start()))
    {
        return Some(line.trim().to_string());
    }

    if stderr.contains("Traceback (most recent call last)") {
        return lines
            .iter()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim().to_string());
    }

    None
}
