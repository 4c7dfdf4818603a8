//! Code adapter: turns schema and failure context into a candidate script.
//!
//! To the pipeline the adapter is a single capability,
//! `adapt(context) -> code`. The context is either the initial description
//! of the task or a repair request carrying the previous code and the
//! classified failure.
//!
//! # Example
//!
//! ```ignore
//! use automl_forge::adapter::{AdaptContext, CodeAdapter, LlmCodeAdapter};
//!
//! let adapter = LlmCodeAdapter::new(provider, "qwen2.5-coder:7b");
//! let code = adapter.adapt(&AdaptContext::Initial(initial)).await?;
//! ```

pub mod algorithm;
pub mod prompts;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::FailureDescriptor;
use crate::error::LlmError;
use crate::llm::{complete, LlmProvider};
use crate::utils::extract_code;

pub use algorithm::AlgorithmType;

/// Errors that can occur while producing code.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Adapter returned no code")]
    EmptyCode,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(alias = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            description: None,
        }
    }
}

/// One table of the source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

/// Serialized schema description supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<TableSchema>,
    /// Free-form notes from the user about the data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<String>,
    /// Connection string the script should read from. Passed through as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
}

impl SchemaContext {
    /// Plain-text description for prompts.
    pub fn describe(&self) -> String {
        let mut text = String::new();
        for table in &self.tables {
            match table.row_count {
                Some(rows) => text.push_str(&format!("Table {} ({} rows):\n", table.name, rows)),
                None => text.push_str(&format!("Table {}:\n", table.name)),
            }
            for column in &table.columns {
                text.push_str(&format!("  - {} ({})", column.name, column.data_type));
                if let Some(description) = &column.description {
                    text.push_str(&format!(": {}", description));
                }
                text.push('\n');
            }
        }
        if self.tables.is_empty() {
            text.push_str("(no tables described)\n");
        }
        if let Some(notes) = self.annotations.as_deref().filter(|n| !n.trim().is_empty()) {
            text.push_str(&format!("Notes: {}\n", notes.trim()));
        }
        text
    }
}

/// Context for the first attempt of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialContext {
    pub schema: SchemaContext,
    pub algorithm: AlgorithmType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eda_summary: Option<String>,
}

/// Context for repairing a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairContext {
    pub initial: InitialContext,
    pub previous_code: String,
    pub failure: FailureDescriptor,
    /// Capped natural-language summary of the failure, when available.
    pub summary: Option<String>,
}

/// Input to [`CodeAdapter::adapt`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptContext {
    Initial(InitialContext),
    Repair(RepairContext),
}

impl AdaptContext {
    pub fn is_repair(&self) -> bool {
        matches!(self, AdaptContext::Repair(_))
    }
}

/// Produces a candidate script for a context.
#[async_trait]
pub trait CodeAdapter: Send + Sync {
    async fn adapt(&self, context: &AdaptContext) -> Result<String, AdapterError>;
}

/// Code adapter backed by an LLM provider.
pub struct LlmCodeAdapter {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmCodeAdapter {
    /// Creates an adapter using `model` (empty means the provider default).
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the completion token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl CodeAdapter for LlmCodeAdapter {
    async fn adapt(&self, context: &AdaptContext) -> Result<String, AdapterError> {
        let prompt = match context {
            AdaptContext::Initial(initial) => prompts::build_initial_prompt(initial),
            AdaptContext::Repair(repair) => prompts::build_repair_prompt(repair),
        };

        tracing::debug!(
            repair = context.is_repair(),
            prompt_chars = prompt.len(),
            "Requesting script from LLM"
        );

        let response = complete(
            self.provider.as_ref(),
            &self.model,
            prompts::ADAPTER_SYSTEM_PROMPT,
            prompt,
            self.temperature,
            self.max_tokens,
        )
        .await?;

        let code = extract_code(&response);
        if code.trim().is_empty() {
            return Err(AdapterError::EmptyCode);
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureKind;
    use crate::llm::{GenerationRequest, GenerationResponse, Role};
    use std::sync::Mutex;

    struct MockLlmProvider {
        response: String,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl MockLlmProvider {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().expect("lock").push(request);
            Ok(GenerationResponse::new("mock-model", self.response.clone()))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            Err(LlmError::RequestFailed("connection refused".to_string()))
        }
    }

    fn initial() -> InitialContext {
        InitialContext {
            schema: SchemaContext {
                tables: vec![TableSchema {
                    name: "sales".to_string(),
                    columns: vec![ColumnSchema::new("amount", "REAL")],
                    row_count: None,
                }],
                annotations: None,
                data_source: None,
            },
            algorithm: AlgorithmType::LinearRegression,
            objective: None,
            eda_summary: None,
        }
    }

    #[test]
    fn test_schema_describe() {
        let mut schema = initial().schema;
        schema.tables[0].columns[0].description = Some("order total".to_string());
        schema.annotations = Some("amounts in EUR".to_string());
        let text = schema.describe();
        assert!(text.contains("Table sales:"));
        assert!(text.contains("  - amount (REAL): order total"));
        assert!(text.contains("Notes: amounts in EUR"));
    }

    #[test]
    fn test_schema_accepts_type_alias() {
        let json = r#"{"tables": [{"name": "t", "columns": [{"name": "c", "type": "TEXT"}]}]}"#;
        let schema: SchemaContext = serde_json::from_str(json).expect("parses");
        assert_eq!(schema.tables[0].columns[0].data_type, "TEXT");
    }

    #[tokio::test]
    async fn test_llm_adapter_strips_prose() {
        let provider = Arc::new(MockLlmProvider::new(
            "Here is your script:\n```python\nprint('model')\n```\nGood luck!",
        ));
        let adapter = LlmCodeAdapter::new(provider.clone(), "m").with_temperature(0.0);

        let code = adapter
            .adapt(&AdaptContext::Initial(initial()))
            .await
            .expect("adapts");
        assert_eq!(code, "print('model')");

        let requests = provider.requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "m");
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert!(requests[0].messages[1].content.contains("sales"));
    }

    #[tokio::test]
    async fn test_llm_adapter_repair_prompt() {
        let provider = Arc::new(MockLlmProvider::new("```python\nfixed()\n```"));
        let adapter = LlmCodeAdapter::new(provider.clone(), "");
        let context = AdaptContext::Repair(RepairContext {
            initial: initial(),
            previous_code: "broken()".to_string(),
            failure: FailureDescriptor::new(FailureKind::RuntimeError, "NameError: broken"),
            summary: None,
        });

        assert_eq!(adapter.adapt(&context).await.expect("adapts"), "fixed()");
        let requests = provider.requests.lock().expect("lock");
        assert!(requests[0].messages[1].content.contains("broken()"));
    }

    #[tokio::test]
    async fn test_llm_adapter_empty_response() {
        let adapter = LlmCodeAdapter::new(Arc::new(MockLlmProvider::new("```python\n```")), "m");
        let err = adapter
            .adapt(&AdaptContext::Initial(initial()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::EmptyCode));
    }

    #[tokio::test]
    async fn test_llm_adapter_provider_failure() {
        let adapter = LlmCodeAdapter::new(Arc::new(FailingProvider), "m");
        let err = adapter
            .adapt(&AdaptContext::Initial(initial()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Llm(LlmError::RequestFailed(_))));
    }
}
