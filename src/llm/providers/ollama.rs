//! Ollama provider implementation.
//!
//! Uses the non-streaming `/api/generate` endpoint of a local Ollama server.
//! The system message maps to Ollama's `system` field; the remaining messages
//! are flattened into a single prompt.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LlmError;
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider, Role, Usage};

/// Default Ollama generate endpoint.
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434/api/generate";

/// Default model to use if none specified.
pub const OLLAMA_DEFAULT_MODEL: &str = "qwen2.5-coder:7b";

/// Provider for a local Ollama server.
pub struct OllamaProvider {
    /// HTTP client for making API requests.
    client: Client,
    /// Full URL of the generate endpoint.
    url: String,
    /// Default model to use when none is specified.
    default_model: String,
    /// Request timeout, reported in timeout errors.
    timeout: Duration,
}

impl OllamaProvider {
    /// Create a new Ollama provider.
    ///
    /// `url` may be the server root (`http://host:11434`) or the full
    /// `/api/generate` endpoint.
    pub fn new(url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: generate_url(&url.into()),
            default_model: model.into(),
            timeout,
        })
    }

    /// Get the generate endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the default model.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

fn generate_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/api/generate") {
        trimmed.to_string()
    } else {
        format!("{}/api/generate", trimmed)
    }
}

/// Internal request structure for `/api/generate`.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ApiOptions>,
}

#[derive(Debug, Serialize)]
struct ApiOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Internal response structure from `/api/generate`.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    done_reason: Option<String>,
}

fn build_request(request: GenerationRequest, default_model: &str) -> ApiRequest {
    let model = if request.model.is_empty() {
        default_model.to_string()
    } else {
        request.model
    };

    let mut system = None;
    let mut prompt_parts = Vec::new();
    for message in request.messages {
        if message.role == Role::System && system.is_none() {
            system = Some(message.content);
        } else {
            prompt_parts.push(message.content);
        }
    }

    let options = if request.temperature.is_some() || request.max_tokens.is_some() {
        Some(ApiOptions {
            temperature: request.temperature,
            num_predict: request.max_tokens,
        })
    } else {
        None
    };

    ApiRequest {
        model,
        prompt: prompt_parts.join("\n\n"),
        system,
        stream: false,
        options,
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let api_request = build_request(request, &self.default_model);

        let http_response = self
            .client
            .post(&self.url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
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
            let message = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse Ollama response: {}", e)))?;

        let model = if api_response.model.is_empty() {
            api_request.model
        } else {
            api_response.model
        };

        Ok(GenerationResponse::new(model, api_response.response)
            .with_truncated(api_response.done_reason.as_deref() == Some("length"))
            .with_usage(Usage {
                prompt_tokens: api_response.prompt_eval_count.unwrap_or(0),
                completion_tokens: api_response.eval_count.unwrap_or(0),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[test]
    fn test_generate_url_normalization() {
        assert_eq!(generate_url("http://localhost:11434"), OLLAMA_DEFAULT_URL);
        assert_eq!(generate_url("http://localhost:11434/"), OLLAMA_DEFAULT_URL);
        assert_eq!(generate_url(OLLAMA_DEFAULT_URL), OLLAMA_DEFAULT_URL);
    }

    #[test]
    fn test_build_request_splits_system_prompt() {
        let request = GenerationRequest::new(
            "",
            vec![Message::system("be terse"), Message::user("fix this")],
        )
        .with_temperature(0.1);

        let api_request = build_request(request, OLLAMA_DEFAULT_MODEL);
        assert_eq!(api_request.model, OLLAMA_DEFAULT_MODEL);
        assert_eq!(api_request.system.as_deref(), Some("be terse"));
        assert_eq!(api_request.prompt, "fix this");
        assert!(!api_request.stream);

        let json = serde_json::to_string(&api_request).expect("serializes");
        assert!(json.contains("\"temperature\":0.1"));
        assert!(!json.contains("num_predict"));
    }

    #[test]
    fn test_build_request_keeps_explicit_model() {
        let request = GenerationRequest::new("llama3", vec![Message::user("hi")]);
        let api_request = build_request(request, OLLAMA_DEFAULT_MODEL);
        assert_eq!(api_request.model, "llama3");
        assert!(api_request.system.is_none());
        assert!(api_request.options.is_none());
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let provider = OllamaProvider::new("http://localhost:65535", "m", Duration::from_secs(5))
            .expect("provider should build");
        let err = provider
            .generate(GenerationRequest::new("", vec![Message::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_) | LlmError::Timeout { .. }));
    }
}
