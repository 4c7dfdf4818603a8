//! Captured result of one script execution.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the child process did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Exit code, `None` if the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The process exceeded its time budget and was killed.
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Some output was dropped to stay within the capture limit.
    #[serde(default)]
    pub truncated: bool,
    /// Working directory the script ran in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl ExecutionOutput {
    /// Exit code rendered for logs and event payloads.
    pub fn exit_label(&self) -> String {
        match self.exit_code {
            Some(code) => code.to_string(),
            None if self.timed_out => "timeout".to_string(),
            None => "signal".to_string(),
        }
    }

    /// Returns true if the process exited with status 0 on its own.
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Returns the last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Line buffer that keeps the most recent output within a byte budget.
///
/// Reports and tracebacks appear at the end of a stream, so the head is
/// what gets dropped.
#[derive(Debug)]
pub(crate) struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit: limit.max(1),
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);

        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(front) = self.lines.pop_front() {
                self.bytes -= front.len();
                self.dropped += front.len();
            }
        }

        if self.bytes > self.limit {
            if let Some(only) = self.lines.pop_front() {
                let mut cut = only.len() - self.limit;
                while !only.is_char_boundary(cut) {
                    cut += 1;
                }
                self.dropped += cut;
                let kept = only[cut..].to_string();
                self.bytes = kept.len();
                self.lines.push_back(kept);
            }
        }
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Empties the buffer, returning its text and whether anything was dropped.
    pub(crate) fn take(&mut self) -> (String, bool) {
        let drained = std::mem::replace(self, TailBuffer::new(self.limit));
        let truncated = drained.is_truncated();
        (drained.into_string(), truncated)
    }

    pub(crate) fn into_string(self) -> String {
        let body: String = self.lines.into_iter().collect();
        if self.dropped > 0 {
            format!("[truncated {} bytes]\n{}", self.dropped, body)
        } else {
            body
        }
    }
}
