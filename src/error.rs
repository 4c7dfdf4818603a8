//! Error types shared across automl-forge subsystems.
//!
//! Subsystem-local errors (sandbox, report extraction, code adaptation,
//! pipeline setup) live next to the code that raises them. This module holds
//! the ones used by more than one subsystem:
//! - LLM provider interactions
//! - Model registry persistence

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),

    #[error("Missing API base URL for provider '{0}'")]
    MissingApiBase(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("LLM request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty response from model '{0}'")]
    EmptyResponse(String),
}

impl LlmError {
    /// Returns true if retrying the same request may succeed.
    ///
    /// Connection problems, rate limits and 5xx responses are transient;
    /// authentication, parse and 4xx errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("temporarily")
            }
            LlmError::RateLimited(_) | LlmError::Timeout { .. } => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Errors that can occur during model registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Run '{0}' not found in registry")]
    RunNotFound(String),

    #[error("Run '{0}' already exists in registry")]
    DuplicateRun(String),

    #[error("Invalid run id '{0}': must be non-empty and contain only alphanumeric characters, hyphens, and underscores")]
    InvalidRunId(String),

    #[error("Metadata missing for run '{0}'")]
    MetadataMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
