//! Transport-level retries for LLM providers.
//!
//! These retries cover unreachable servers, rate limits and 5xx responses.
//! They are unrelated to the pipeline's code-repair attempts and never
//! consume that budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider};

/// Retry policy for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first try. Zero disables retrying.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given retry count and a 1s base delay.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(1000),
        }
    }

    /// Sets the base backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Backoff before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(6);
        self.base_delay * (1u32 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Wraps a provider and retries transient failures with exponential backoff.
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    /// Wraps `inner` with the given retry policy.
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let mut retry = 0u32;
        loop {
            match self.inner.generate(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && retry < self.policy.max_retries => {
                    retry += 1;
                    let delay = self.policy.delay_for(retry);
                    tracing::warn!(
                        retry = retry,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient LLM error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
