//! Chat Completions API, for OpenAI itself and for compatible servers.

use crate::llm_provider::{
    with_retries, AttemptError, Completion, LLMProvider, LLMResult, Prompt, SamplingParams,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// "openai" requires a key; anything else is treated as a compatible server.
    pub provider_name: String,
}

impl OpenAIConfig {
    /// Hosted OpenAI with the default model.
    pub fn hosted(api_key: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: Some(api_key.into()),
            timeout_secs: 120,
            max_retries: 3,
            provider_name: "openai".to_string(),
        }
    }

    /// A self-hosted server speaking the same protocol. The key is optional.
    pub fn compatible(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout_secs: 120,
            max_retries: 3,
            provider_name: "openai-compatible".to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn requires_key(&self) -> bool {
        self.provider_name == "openai"
    }
}

pub struct OpenAIProvider {
    config: OpenAIConfig,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> LLMResult<Self> {
        let has_key = config
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if config.requires_key() && !has_key {
            return Err(anyhow!(
                "OpenAI API key is missing. Set llm.openai_api_key or OPENAI_API_KEY"
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .with_context(|| format!("Failed to build the {} HTTP client", config.provider_name))?;
        Ok(Self { config, client })
    }

    async fn post(&self, body: &ChatRequest<'_>) -> Result<ChatResponse, AttemptError> {
        let name = &self.config.provider_name;
        let mut request = self.client.post(self.config.endpoint()).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            AttemptError::Transient(anyhow!(
                "{} request to {} failed: {}",
                name,
                self.config.base_url,
                e
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AttemptError::from_status(
                status,
                anyhow!("{} API returned {}: {}", name, status, detail),
            ));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| AttemptError::Permanent(anyhow!("Unreadable {} response: {}", name, e)))
    }
}

fn chat_request<'a>(
    model: &'a str,
    prompt: &'a Prompt,
    params: &'a SamplingParams,
) -> ChatRequest<'a> {
    let mut messages = Vec::with_capacity(2);
    if !prompt.system.is_empty() {
        messages.push(ChatTurn {
            role: "system",
            content: &prompt.system,
        });
    }
    messages.push(ChatTurn {
        role: "user",
        content: &prompt.user,
    });

    ChatRequest {
        model,
        messages,
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        stop: (!params.stop.is_empty()).then_some(params.stop.as_slice()),
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn complete(&self, prompt: &Prompt, params: &SamplingParams) -> LLMResult<Completion> {
        let body = chat_request(&self.config.model, prompt, params);
        let response = with_retries(&self.config.provider_name, self.config.max_retries, || {
            self.post(&body)
        })
        .await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} returned no choices", self.config.provider_name))?;

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_else(|| self.config.model.clone()),
            input_tokens: response.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: response.usage.as_ref().map(|u| u.completion_tokens),
            stop_reason: choice.finish_reason,
        })
    }

    fn provider_name(&self) -> &str {
        &self.config.provider_name
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn<'a>>,
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct ChatTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
}
