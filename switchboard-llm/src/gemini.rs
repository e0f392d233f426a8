use crate::traits::{status_error, LlmClient, LlmError, LlmResponse};
use crate::PROVIDER_GEMINI;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_common::{ChatMessage, ChatRole};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
enum GeminiPart {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "inline_data")]
    InlineData { mime_type: String, data: String },
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiUsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u32>,
}

/// Google Gemini API client.
///
/// System turns are lifted into `system_instruction`; assistant turns map to
/// Gemini's `model` role.
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different endpoint (test doubles, gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate(
        &self,
        model: &str,
        request: &GeminiRequest,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        tracing::debug!(model, "gemini.request");

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .query(&[("key", &self.api_key)])
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let parsed: GeminiResponse = resp.json().await?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?;

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(LlmError::Api {
                status: 200,
                message: "content blocked by Gemini safety filters".to_string(),
            });
        }

        let text = candidate
            .content
            .parts
            .into_iter()
            .next()
            .map(|p| p.text)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(LlmResponse {
            text,
            model: parsed.model_version.or_else(|| Some(model.to_string())),
            tokens_used: parsed.usage_metadata.and_then(|u| u.total_token_count),
        })
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(
        &self,
        model: &str,
        history: &[ChatMessage],
    ) -> Result<LlmResponse, LlmError> {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in history {
            match msg.role {
                ChatRole::System => system_parts.push(GeminiPart::Text(msg.content.clone())),
                ChatRole::User => contents.push(GeminiContent {
                    role: "user",
                    parts: vec![GeminiPart::Text(msg.content.clone())],
                }),
                ChatRole::Assistant => contents.push(GeminiContent {
                    role: "model",
                    parts: vec![GeminiPart::Text(msg.content.clone())],
                }),
            }
        }

        let request = GeminiRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(GeminiSystemInstruction {
                    parts: system_parts,
                })
            },
        };

        self.generate(model, &request).await
    }

    async fn analyze_image(
        &self,
        model: &str,
        image_b64: &str,
        prompt: &str,
    ) -> Result<LlmResponse, LlmError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![
                    GeminiPart::Text(prompt.to_string()),
                    GeminiPart::InlineData {
                        mime_type: "image/jpeg".to_string(),
                        data: image_b64.to_string(),
                    },
                ],
            }],
            system_instruction: None,
        };

        self.generate(model, &request).await
    }

    fn provider(&self) -> &str {
        PROVIDER_GEMINI
    }
}
