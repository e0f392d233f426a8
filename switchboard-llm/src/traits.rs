use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchboard_common::ChatMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
}

#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Invalid API key")]
    InvalidKey,

    #[error("Empty response from provider")]
    EmptyResponse,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// One remote LLM API, bound to a single key. The broker treats instances
/// as thread-safe for one-call-at-a-time use, which the per-key dispatch
/// loop guarantees.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the conversation history to `model` and return its reply.
    async fn chat(
        &self,
        model: &str,
        history: &[ChatMessage],
    ) -> Result<LlmResponse, LlmError>;

    /// Ask `model` to describe a base64-encoded image.
    async fn analyze_image(
        &self,
        model: &str,
        image_b64: &str,
        prompt: &str,
    ) -> Result<LlmResponse, LlmError>;

    /// Provider name this client talks to (`mistral`, `gemini`, ...).
    fn provider(&self) -> &str;
}

/// Map a non-success provider status onto the error taxonomy.
pub(crate) fn status_error(status: u16, message: String) -> LlmError {
    match status {
        429 => LlmError::RateLimit,
        401 => LlmError::InvalidKey,
        _ => LlmError::Api { status, message },
    }
}
