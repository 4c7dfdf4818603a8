//! OpenAI-compatible client implementation.
//!
//! Talks to any `/chat/completions` endpoint: OpenAI, OpenRouter, a LiteLLM
//! proxy, LM Studio, vLLM. Also defines the provider-neutral request and
//! response types every provider converts to.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LlmError;

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request for text generation from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier. Empty means the provider default.
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token counts reported by the provider, zero when it reports none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One completion. Providers that return several choices keep the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Model that actually answered.
    pub model: String,
    pub content: String,
    /// Generation stopped at the token limit.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub usage: Usage,
}

impl GenerationResponse {
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            content: content.into(),
            truncated: false,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// The completion text, `None` if blank.
    pub fn text(&self) -> Option<&str> {
        Some(self.content.as_str()).filter(|text| !text.trim().is_empty())
    }
}

/// Trait for LLM providers that can generate text.
///
/// This is the only LLM seam the pipeline sees: submit a prompt, get text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Sends a system + user prompt and returns the completion text.
///
/// An empty `model` selects the provider's default model.
pub async fn complete(
    provider: &dyn LlmProvider,
    model: &str,
    system: &str,
    user: impl Into<String>,
    temperature: f64,
    max_tokens: u32,
) -> Result<String, LlmError> {
    let request = GenerationRequest::new(model, vec![Message::system(system), Message::user(user)])
        .with_temperature(temperature)
        .with_max_tokens(max_tokens);

    let response = provider.generate(request).await?;
    tracing::debug!(
        model = %response.model,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        "LLM completion received"
    );
    if response.truncated {
        // A cut-off script fails at runtime; the repair loop handles it.
        tracing::warn!(
            model = %response.model,
            max_tokens = max_tokens,
            "LLM completion hit the token limit"
        );
    }

    match response.text() {
        Some(text) => Ok(text.to_string()),
        None => Err(LlmError::EmptyResponse(response.model)),
    }
}

/// Client for OpenAI-compatible APIs.
pub struct LiteLlmClient {
    /// Base URL without the `/chat/completions` suffix.
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http_client: Client,
    /// Request timeout, reported in timeout errors.
    timeout: Duration,
}

impl LiteLlmClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL for the API (e.g., "http://localhost:4000/v1")
    /// * `api_key` - Optional API key for authentication
    /// * `default_model` - Model used when a request names none
    /// * `timeout` - Per-request timeout
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: normalize_api_base(&api_base.into()),
            api_key,
            default_model: default_model.into(),
            http_client,
            timeout,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

/// Strips a trailing slash and an explicit `/chat/completions` suffix.
fn normalize_api_base(api_base: &str) -> String {
    let trimmed = api_base.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/chat/completions")
        .unwrap_or(trimmed)
        .to_string()
}

/// Wire format of a `/chat/completions` request.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// `{"error": {"message": ...}}` body returned on failure.
#[derive(Debug, Deserialize)]
struct ChatError {
    error: ChatErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ChatErrorDetail {
    message: String,
}

/// Maps a non-success status and body to an [`LlmError`].
fn api_error(status: u16, body: String) -> LlmError {
    let message = serde_json::from_str::<ChatError>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    if status == 429 {
        LlmError::RateLimited(message)
    } else {
        LlmError::ApiError {
            code: status,
            message,
        }
    }
}

impl ChatResponse {
    fn into_generation(self, requested_model: &str) -> GenerationResponse {
        let model = if self.model.is_empty() {
            requested_model.to_string()
        } else {
            self.model
        };
        let (content, finish_reason) = self
            .choices
            .into_iter()
            .next()
            .map(|choice| (choice.message.content.unwrap_or_default(), choice.finish_reason))
            .unwrap_or_default();

        GenerationResponse::new(model, content)
            .with_truncated(finish_reason.as_deref() == Some("length"))
            .with_usage(self.usage.unwrap_or_default())
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };

        let body = ChatRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http_request = self
            .http_client
            .post(self.completions_url())
            .header("X-Title", "automl-forge");
        if let Some(ref api_key) = self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let http_response = http_request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
            } else {
                LlmError::RequestFailed(e.to_string())
            }
        })?;

        let status = http_response.status();
        if !status.is_success() {
            let text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(api_error(status.as_u16(), text));
        }

        let chat: ChatResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        Ok(chat.into_generation(model))
    }
}
