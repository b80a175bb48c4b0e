use crate::error::{LlmError, Result};
use crate::openai::{OpenAiChatRequest, OpenAiChatResponse};
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(cfg: LlmClientConfig) -> Result<Self> {
        let model = cfg.model.trim().to_string();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model must not be empty".to_string()));
        }
        let base_url = cfg.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LlmError::InvalidInput(
                "base_url must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            base_url,
            api_key: cfg.api_key,
            model,
            temperature: cfg.temperature,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One non-streaming completion. With `json_mode` the provider is asked for a
    /// single JSON object as the reply.
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage], json_mode: bool) -> Result<ChatResponse> {
        let req = OpenAiChatRequest::new(&self.model, messages, self.temperature, json_mode);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "chat completion status={status} body={body}"
            )));
        }

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        let resp = ChatResponse::try_from(parsed)?;
        tracing::debug!(
            prompt_tokens = resp.usage.prompt_tokens,
            completion_tokens = resp.usage.completion_tokens,
            finish_reason = %resp.finish_reason,
            content_len = resp.message.content.len(),
            "chat completion received"
        );
        Ok(resp)
    }
}
