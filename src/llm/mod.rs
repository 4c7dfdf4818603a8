//! LLM integration for automl-forge.
//!
//! The pipeline treats the LLM as a black-box capability: submit a prompt,
//! get text back. Provider selection is configuration, resolved once per run
//! by [`build_provider`]; nothing downstream branches on provider identity.
//!
//! ```ignore
//! use automl_forge::llm::{build_provider, complete};
//! use automl_forge::settings::Settings;
//!
//! let settings = Settings::from_env()?;
//! let provider = build_provider(&settings.llm)?;
//! let text = complete(provider.as_ref(), "", "You are terse.", "Say hi", 0.0, 16).await?;
//! ```

pub mod litellm;
pub mod providers;

use std::sync::Arc;
use std::time::Duration;

pub use litellm::{
    complete, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Role,
    Usage,
};
pub use providers::{OllamaProvider, RetryPolicy, RetryingProvider};

use crate::error::LlmError;
use crate::settings::{LlmSettings, ProviderKind};

/// Builds the configured provider, wrapped with transport-level retries.
///
/// # Errors
///
/// Returns `LlmError::MissingApiBase` if no API URL is configured, or
/// `LlmError::MissingApiKey` for hosted OpenAI-compatible endpoints
/// without a key.
pub fn build_provider(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    let api_url = settings.api_url.trim();
    if api_url.is_empty() {
        return Err(LlmError::MissingApiBase(settings.provider.to_string()));
    }

    let inner: Arc<dyn LlmProvider> = match settings.provider {
        ProviderKind::OpenAi => {
            let api_key = settings
                .api_key
                .clone()
                .filter(|key| !key.trim().is_empty());
            if api_key.is_none() && !is_local_url(api_url) {
                return Err(LlmError::MissingApiKey(settings.provider.to_string()));
            }
            Arc::new(LiteLlmClient::new(api_url, api_key, &settings.model, timeout)?)
        }
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(api_url, &settings.model, timeout)?),
    };

    tracing::debug!(
        provider = %settings.provider,
        model = %settings.model,
        transport_retries = settings.transport_retries,
        "Resolved LLM provider"
    );

    Ok(Arc::new(RetryingProvider::new(
        inner,
        RetryPolicy::new(settings.transport_retries),
    )))
}

fn is_local_url(url: &str) -> bool {
    url.contains("://localhost") || url.contains("://127.0.0.1") || url.contains("://[::1]")
}
