//! Per-run configuration for the retry orchestrator.
//!
//! A `PipelineConfig` is derived once from a settings snapshot when the
//! orchestrator is built; later settings changes do not reach it.

use std::time::Duration;

use crate::analysis::DEFAULT_SUMMARY_MAX_CHARS;
use crate::settings::{Settings, MAX_RETRIES_LIMIT};

use super::PipelineError;

/// Configuration for one orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Attempt ceiling per run (`1 + max_retries`).
    pub max_attempts: u32,
    /// Interval between heartbeat events, `None` to disable them.
    pub heartbeat: Option<Duration>,
    /// Cap on failure summaries shown to users and fed back to the adapter.
    pub summary_max_chars: usize,
    /// Patch missing imports locally instead of calling the adapter.
    pub quick_fixes: bool,
    /// Forward each stdout line of a running script as an `info` event.
    pub forward_stdout: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            heartbeat: Some(Duration::from_secs(10)),
            summary_max_chars: DEFAULT_SUMMARY_MAX_CHARS,
            quick_fixes: true,
            forward_stdout: true,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the configuration from a settings snapshot.
    pub fn from_settings(settings: &Settings) -> Self {
        let pipeline = &settings.pipeline;
        Self {
            max_attempts: settings.max_attempts(),
            heartbeat: (pipeline.heartbeat_secs > 0)
                .then(|| Duration::from_secs(pipeline.heartbeat_secs)),
            summary_max_chars: pipeline.summary_max_chars,
            quick_fixes: pipeline.quick_fixes,
            forward_stdout: true,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_attempts > MAX_RETRIES_LIMIT + 1 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_attempts cannot exceed {}",
                MAX_RETRIES_LIMIT + 1
            )));
        }
        if self.heartbeat == Some(Duration::ZERO) {
            return Err(PipelineError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.summary_max_chars == 0 {
            return Err(PipelineError::InvalidConfig(
                "summary_max_chars must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Sets the failure summary cap.
    pub fn with_summary_max_chars(mut self, max_chars: usize) -> Self {
        self.summary_max_chars = max_chars;
        self
    }

    /// Enables or disables local quick fixes.
    pub fn with_quick_fixes(mut self, enabled: bool) -> Self {
        self.quick_fixes = enabled;
        self
    }

    /// Enables or disables stdout forwarding.
    pub fn with_forward_stdout(mut self, enabled: bool) -> Self {
        self.forward_stdout = enabled;
        self
    }
}
