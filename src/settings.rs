//! Process-wide settings for automl-forge.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables, then CLI flags (applied by the binary). A
//! [`SettingsStore`] holds the current value; each pipeline run takes an
//! immutable snapshot when it starts, so updates only affect later runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::litellm::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::llm::providers::ollama::{OLLAMA_DEFAULT_MODEL, OLLAMA_DEFAULT_URL};

/// Upper bound for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 49;

/// Placeholder shown instead of the API key.
pub const REDACTED: &str = "***";

/// Errors that can occur while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Settings validation failed.
    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading or writing the settings file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Which wire protocol the LLM endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions` (OpenAI, OpenRouter, LiteLLM, LM Studio).
    #[serde(rename = "openai", alias = "openrouter", alias = "litellm", alias = "lmstudio")]
    OpenAi,
    /// Ollama `/api/generate`.
    #[serde(rename = "ollama")]
    Ollama,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openrouter" | "litellm" | "lmstudio" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(SettingsError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                message: format!("unknown provider '{}'", other),
            }),
        }
    }
}

/// LLM connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub api_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub temperature: f64,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Transport-level retries for unreachable or overloaded endpoints.
    pub transport_retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            api_url: OLLAMA_DEFAULT_URL.to_string(),
            model: OLLAMA_DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.2,
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            transport_retries: 2,
        }
    }
}

/// Retry loop and sandbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Repair attempts after the first execution (0..=49).
    pub max_retries: u32,
    /// Wall-clock budget for one script execution.
    pub script_timeout_secs: u64,
    /// Interpreter used to run generated scripts.
    pub interpreter: String,
    /// Root of per-run working directories.
    pub workspace_dir: PathBuf,
    /// Interval between heartbeat events during long waits.
    pub heartbeat_secs: u64,
    /// Cap on the natural-language failure summary.
    pub summary_max_chars: usize,
    /// Apply local quick fixes (missing imports) instead of a full repair.
    pub quick_fixes: bool,
    /// Ask the LLM for a failure summary before repairing.
    pub summarize_failures: bool,
    /// Cap on captured stdout/stderr per stream.
    pub output_limit_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            script_timeout_secs: 60,
            interpreter: "python3".to_string(),
            workspace_dir: PathBuf::from("runs"),
            heartbeat_secs: 10,
            summary_max_chars: 400,
            quick_fixes: true,
            summarize_failures: true,
            output_limit_bytes: 256 * 1024,
        }
    }
}

/// Complete process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub pipeline: PipelineSettings,
    /// Directory of the filesystem model registry.
    pub models_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            pipeline: PipelineSettings::default(),
            models_dir: PathBuf::from("models"),
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from defaults and environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LLM_PROVIDER`: `ollama` (default), `openai`, `openrouter`, `litellm`, `lmstudio`
    /// - `LLM_API_URL`, `LLM_MODEL`, `LLM_API_KEY`
    /// - `LLM_TEMPERATURE`, `LLM_TIMEOUT_SECS`, `LLM_TRANSPORT_RETRIES`
    /// - `AUTOML_MAX_RETRIES`: repair attempts (default: 2, max: 49)
    /// - `AUTOML_SCRIPT_TIMEOUT_SECS`: script budget (default: 60)
    /// - `AUTOML_INTERPRETER`: default `python3`
    /// - `AUTOML_WORKSPACE_DIR`, `AUTOML_MODELS_DIR`
    /// - `AUTOML_HEARTBEAT_SECS`, `AUTOML_SUMMARY_MAX_CHARS`, `AUTOML_OUTPUT_LIMIT_BYTES`
    /// - `AUTOML_QUICK_FIXES`, `AUTOML_SUMMARIZE_FAILURES`: booleans
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::new();
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from an optional YAML file, then applies environment
    /// overrides. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) if path.exists() => Self::from_yaml_file(path)?,
            _ => Self::new(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a YAML file without environment overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Writes settings to a YAML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Applies overrides from a key lookup (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("LLM_PROVIDER") {
            self.llm.provider = val.parse()?;
        }
        if let Some(val) = lookup("LLM_API_URL") {
            self.llm.api_url = val;
        }
        if let Some(val) = lookup("LLM_MODEL") {
            self.llm.model = val;
        }
        if let Some(val) = lookup("LLM_API_KEY") {
            self.llm.api_key = if val.trim().is_empty() { None } else { Some(val) };
        }
        if let Some(val) = lookup("LLM_TEMPERATURE") {
            self.llm.temperature = parse_env_value(&val, "LLM_TEMPERATURE")?;
        }
        if let Some(val) = lookup("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env_value(&val, "LLM_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("LLM_TRANSPORT_RETRIES") {
            self.llm.transport_retries = parse_env_value(&val, "LLM_TRANSPORT_RETRIES")?;
        }

        if let Some(val) = lookup("AUTOML_MAX_RETRIES") {
            self.pipeline.max_retries = parse_env_value(&val, "AUTOML_MAX_RETRIES")?;
        }
        if let Some(val) = lookup("AUTOML_SCRIPT_TIMEOUT_SECS") {
            self.pipeline.script_timeout_secs = parse_env_value(&val, "AUTOML_SCRIPT_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("AUTOML_INTERPRETER") {
            self.pipeline.interpreter = val;
        }
        if let Some(val) = lookup("AUTOML_WORKSPACE_DIR") {
            self.pipeline.workspace_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("AUTOML_MODELS_DIR") {
            self.models_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("AUTOML_HEARTBEAT_SECS") {
            self.pipeline.heartbeat_secs = parse_env_value(&val, "AUTOML_HEARTBEAT_SECS")?;
        }
        if let Some(val) = lookup("AUTOML_SUMMARY_MAX_CHARS") {
            self.pipeline.summary_max_chars = parse_env_value(&val, "AUTOML_SUMMARY_MAX_CHARS")?;
        }
        if let Some(val) = lookup("AUTOML_OUTPUT_LIMIT_BYTES") {
            self.pipeline.output_limit_bytes = parse_env_value(&val, "AUTOML_OUTPUT_LIMIT_BYTES")?;
        }
        if let Some(val) = lookup("AUTOML_QUICK_FIXES") {
            self.pipeline.quick_fixes = parse_env_bool(&val, "AUTOML_QUICK_FIXES")?;
        }
        if let Some(val) = lookup("AUTOML_SUMMARIZE_FAILURES") {
            self.pipeline.summarize_failures = parse_env_bool(&val, "AUTOML_SUMMARIZE_FAILURES")?;
        }

        Ok(())
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pipeline.max_retries > MAX_RETRIES_LIMIT {
            return Err(SettingsError::ValidationFailed(format!(
                "max_retries must be between 0 and {}",
                MAX_RETRIES_LIMIT
            )));
        }

        if self.pipeline.script_timeout_secs == 0 {
            return Err(SettingsError::ValidationFailed(
                "script_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.interpreter.trim().is_empty() {
            return Err(SettingsError::ValidationFailed(
                "interpreter cannot be empty".to_string(),
            ));
        }

        if self.pipeline.heartbeat_secs == 0 {
            return Err(SettingsError::ValidationFailed(
                "heartbeat_secs must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.summary_max_chars == 0 {
            return Err(SettingsError::ValidationFailed(
                "summary_max_chars must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.output_limit_bytes == 0 {
            return Err(SettingsError::ValidationFailed(
                "output_limit_bytes must be greater than 0".to_string(),
            ));
        }

        if self.llm.api_url.trim().is_empty() {
            return Err(SettingsError::ValidationFailed(
                "llm.api_url cannot be empty".to_string(),
            ));
        }

        if self.llm.model.trim().is_empty() {
            return Err(SettingsError::ValidationFailed(
                "llm.model cannot be empty".to_string(),
            ));
        }

        if self.llm.timeout_secs == 0 {
            return Err(SettingsError::ValidationFailed(
                "llm.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(SettingsError::ValidationFailed(
                "llm.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Attempt ceiling for one pipeline run: the first try plus retries.
    pub fn max_attempts(&self) -> u32 {
        1 + self.pipeline.max_retries
    }

    /// Copy suitable for display, with the API key masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some(REDACTED.to_string());
        }
        copy
    }

    /// Builder method to set max retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.pipeline.max_retries = max_retries;
        self
    }

    /// Builder method to set the script timeout.
    pub fn with_script_timeout_secs(mut self, secs: u64) -> Self {
        self.pipeline.script_timeout_secs = secs;
        self
    }

    /// Builder method to set the interpreter.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.pipeline.interpreter = interpreter.into();
        self
    }

    /// Builder method to set the model registry directory.
    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }
}

/// Shared settings handle with explicit replace/reload semantics.
///
/// Readers get an `Arc<Settings>` snapshot; a replacement never mutates a
/// snapshot already handed out.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    current: Arc<RwLock<Arc<Settings>>>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// Creates a store holding `settings`, persisting updates to `path` if set.
    pub fn new(settings: Settings, path: Option<PathBuf>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            path,
        }
    }

    /// Returns the settings in effect right now.
    pub fn snapshot(&self) -> Arc<Settings> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validates and installs new settings, writing them to the settings file
    /// if one is configured. Runs already in flight keep their snapshot.
    pub fn replace(&self, settings: Settings) -> Result<Arc<Settings>, SettingsError> {
        settings.validate()?;
        if let Some(path) = &self.path {
            settings.save(path)?;
        }
        let settings = Arc::new(settings);
        self.install(settings.clone());
        tracing::info!(
            provider = %settings.llm.provider,
            model = %settings.llm.model,
            max_retries = settings.pipeline.max_retries,
            "Settings updated"
        );
        Ok(settings)
    }

    /// Re-reads the settings file and environment.
    pub fn reload(&self) -> Result<Arc<Settings>, SettingsError> {
        let settings = Arc::new(Settings::load(self.path.as_deref())?);
        self.install(settings.clone());
        tracing::info!("Settings reloaded");
        Ok(settings)
    }

    /// Path of the backing settings file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn install(&self, settings: Arc<Settings>) {
        match self.current.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, SettingsError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
