//! LLM provider implementations beyond the OpenAI-compatible client.
//!
//! - [`OllamaProvider`]: local Ollama server via `/api/generate`
//! - [`RetryingProvider`]: transport-level retry wrapper for any provider

pub mod ollama;
pub mod retry;

pub use ollama::OllamaProvider;
pub use retry::{RetryPolicy, RetryingProvider};

// Re-export the main LlmProvider trait from litellm for convenience
pub use super::litellm::LlmProvider;
