//! Provider‑agnostic LLM integration for Switchboard.
//!
//! This crate exposes a common [`traits::LlmClient`] interface and concrete
//! provider implementations for Mistral and Gemini. Clients are constructed
//! once per API key; the model is chosen per call, because a single key may
//! serve many models and the broker routes `(provider, model)` targets onto
//! keys dynamically.

pub mod gemini;
pub mod mistral;
pub mod traits;

use gemini::GeminiClient;
use mistral::MistralClient;
use std::sync::Arc;
use traits::{LlmClient, LlmError};

pub const PROVIDER_MISTRAL: &str = "mistral";
pub const PROVIDER_GEMINI: &str = "gemini";

/// Every provider the broker can construct clients for.
pub const PROVIDERS: [&str; 2] = [PROVIDER_MISTRAL, PROVIDER_GEMINI];

/// Default target for image analysis when the request names no model.
pub const DEFAULT_IMAGE_MODEL: &str = "magistral-small-2509";

/// Construct a provider client for `provider` bound to `api_key`.
pub fn build_client(
    provider: &str,
    api_key: String,
) -> Result<Arc<dyn LlmClient + Send + Sync>, LlmError> {
    match provider {
        PROVIDER_MISTRAL => Ok(Arc::new(MistralClient::new(api_key)?)),
        PROVIDER_GEMINI => Ok(Arc::new(GeminiClient::new(api_key)?)),
        other => Err(LlmError::Config(format!("unknown provider: {other}"))),
    }
}
