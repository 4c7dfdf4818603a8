//! Progress events emitted by the orchestrator.
//!
//! Each event is one `{status, message, data}` record. Within a run events
//! are totally ordered; `success` and `final_error` are terminal and always
//! last.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Status tag of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Info,
    Fixing,
    Error,
    Success,
    FinalError,
    /// Any status this version does not know. Consumers keep going.
    #[serde(other)]
    Unknown,
}

impl EventStatus {
    /// Returns true for `success` and `final_error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Success | EventStatus::FinalError)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Info => write!(f, "info"),
            EventStatus::Fixing => write!(f, "fixing"),
            EventStatus::Error => write!(f, "error"),
            EventStatus::Success => write!(f, "success"),
            EventStatus::FinalError => write!(f, "final_error"),
            EventStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One unit of the progress protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub status: EventStatus,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn new(status: EventStatus, message: impl Into<String>, data: Value) -> Self {
        Self {
            status,
            message: message.into(),
            data,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Info, message, Value::Null)
    }

    pub fn fixing(message: impl Into<String>, data: Value) -> Self {
        Self::new(EventStatus::Fixing, message, data)
    }

    pub fn error(message: impl Into<String>, data: Value) -> Self {
        Self::new(EventStatus::Error, message, data)
    }

    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self::new(EventStatus::Success, message, data)
    }

    pub fn final_error(message: impl Into<String>, data: Value) -> Self {
        Self::new(EventStatus::FinalError, message, data)
    }

    /// Attaches a data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Heartbeat sent while a long phase is in progress.
    pub fn heartbeat(phase: &str, attempt: u32, elapsed_secs: u64) -> Self {
        let message = match phase {
            "executing" => format!("Attempt {} still running ({}s)...", attempt, elapsed_secs),
            "analyzing" => format!("Still analyzing the failure ({}s)...", elapsed_secs),
            _ => format!("Still generating code ({}s)...", elapsed_secs),
        };
        Self::info(message).with_data(json!({
            "heartbeat": true,
            "phase": phase,
            "attempt": attempt,
            "elapsed_secs": elapsed_secs,
        }))
    }

    /// Returns true for `success` and `final_error`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
