use crate::traits::{status_error, LlmClient, LlmError, LlmResponse};
use crate::PROVIDER_MISTRAL;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchboard_common::{ChatMessage, ChatRole};

const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";

#[derive(Debug, Serialize)]
struct MistralRequest {
    model: String,
    messages: Vec<MistralMessage>,
}

#[derive(Debug, Serialize)]
struct MistralMessage {
    role: &'static str,
    content: MistralContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MistralContent {
    Text(String),
    Parts(Vec<MistralPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum MistralPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: String },
}

#[derive(Debug, Deserialize)]
struct MistralResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<MistralChoice>,
    usage: Option<MistralUsage>,
}

#[derive(Debug, Deserialize)]
struct MistralChoice {
    message: MistralResponseMessage,
}

#[derive(Debug, Deserialize)]
struct MistralResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct MistralUsage {
    #[serde(rename = "total_tokens")]
    total_tokens: Option<u32>,
}

/// Mistral chat-completions client. The API is OpenAI-shaped; images ride
/// along as `image_url` content parts carrying a data URI.
pub struct MistralClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl MistralClient {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: MISTRAL_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different endpoint (test doubles, gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn complete(&self, request: &MistralRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(model = %request.model, "mistral.request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let parsed: MistralResponse = resp.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(LlmResponse {
            text,
            model: parsed.model,
            tokens_used: parsed.usage.and_then(|u| u.total_tokens),
        })
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::System => "system",
    }
}

#[async_trait]
impl LlmClient for MistralClient {
    async fn chat(
        &self,
        model: &str,
        history: &[ChatMessage],
    ) -> Result<LlmResponse, LlmError> {
        let messages = history
            .iter()
            .map(|m| MistralMessage {
                role: role_str(m.role),
                content: MistralContent::Text(m.content.clone()),
            })
            .collect();

        self.complete(&MistralRequest {
            model: model.to_string(),
            messages,
        })
        .await
    }

    async fn analyze_image(
        &self,
        model: &str,
        image_b64: &str,
        prompt: &str,
    ) -> Result<LlmResponse, LlmError> {
        let message = MistralMessage {
            role: "user",
            content: MistralContent::Parts(vec![
                MistralPart::Text {
                    text: prompt.to_string(),
                },
                MistralPart::ImageUrl {
                    image_url: format!("data:image/jpeg;base64,{image_b64}"),
                },
            ]),
        };

        self.complete(&MistralRequest {
            model: model.to_string(),
            messages: vec![message],
        })
        .await
    }

    fn provider(&self) -> &str {
        PROVIDER_MISTRAL
    }
}
