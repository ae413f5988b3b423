//! Anthropic Messages API.

use crate::llm_provider::{
    with_retries, AttemptError, Completion, LLMProvider, LLMResult, Prompt, SamplingParams,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> LLMResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(anyhow!(
                "Anthropic API key is missing. Set llm.anthropic_api_key or ANTHROPIC_API_KEY"
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build the Anthropic HTTP client")?;
        Ok(Self { config, client })
    }

    async fn post(&self, body: &MessagesRequest<'_>) -> Result<MessagesResponse, AttemptError> {
        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(anyhow!("Anthropic request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AttemptError::from_status(
                status,
                anyhow!("Anthropic API returned {}: {}", status, detail),
            ));
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| AttemptError::Permanent(anyhow!("Unreadable Anthropic response: {}", e)))
    }
}

fn messages_request<'a>(
    model: &'a str,
    prompt: &'a Prompt,
    params: &'a SamplingParams,
) -> MessagesRequest<'a> {
    MessagesRequest {
        model,
        system: (!prompt.system.is_empty()).then_some(prompt.system.as_str()),
        messages: vec![TurnMessage {
            role: "user",
            content: &prompt.user,
        }],
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        stop_sequences: (!params.stop.is_empty()).then_some(params.stop.as_slice()),
    }
}

impl MessagesResponse {
    /// Concatenates the text blocks; tool and other blocks are ignored.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect()
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn complete(&self, prompt: &Prompt, params: &SamplingParams) -> LLMResult<Completion> {
        let body = messages_request(&self.config.model, prompt, params);
        let response = with_retries("Anthropic", self.config.max_retries, || self.post(&body)).await?;

        Ok(Completion {
            text: response.text(),
            model: response.model,
            input_tokens: Some(response.usage.input_tokens),
            output_tokens: Some(response.usage.output_tokens),
            stop_reason: response.stop_reason,
        })
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<TurnMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct TurnMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    input_tokens: usize,
    output_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_key_is_rejected() {
        assert!(AnthropicProvider::new(AnthropicConfig::new("  ")).is_err());
        assert!(AnthropicProvider::new(AnthropicConfig::new("sk-ant-test")).is_ok());
    }

    #[test]
    fn test_request_body() {
        let prompt = Prompt::new("Return JSON only", "Sheet1: orders");
        let params = SamplingParams::default();
        let body = serde_json::to_value(messages_request(DEFAULT_MODEL, &prompt, &params)).unwrap();

        assert_eq!(body["system"], "Return JSON only");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Sheet1: orders");
        assert_eq!(body["max_tokens"], 2000);
        assert!(body.get("stop_sequences").is_none());
    }

    #[test]
    fn test_text_skips_non_text_blocks() {
        let response: MessagesResponse = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": DEFAULT_MODEL,
            "stop_reason": "end_turn",
            "content": [
                {"type": "text", "text": "{\"tables\":"},
                {"type": "tool_use", "id": "t"},
                {"type": "text", "text": "[]}"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }))
        .unwrap();

        assert_eq!(response.text(), "{\"tables\":[]}");
    }
}
