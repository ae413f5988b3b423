use crate::llm_factory::LLMProviderFactory;
use crate::llm_provider::{LLMProvider, Prompt, SamplingParams};
use crate::prompt::{extraction_prompt, SYSTEM_PROMPT};
use async_trait::async_trait;
use querygraph_core::{LLMConfig, MappingExtractor, QueryGraphError, Result, StructuredMapping};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Mapping extractor backed by an LLM provider.
pub struct LlmMappingExtractor {
    provider: Arc<dyn LLMProvider>,
    params: SamplingParams,
}

impl LlmMappingExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            params: SamplingParams::default(),
        }
    }

    pub fn with_sampling_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn from_config(config: &LLMConfig) -> anyhow::Result<Self> {
        let provider = LLMProviderFactory::create_from_config(config)?;
        Ok(Self::new(provider).with_sampling_params(SamplingParams::from(config)))
    }
}

#[async_trait]
impl MappingExtractor for LlmMappingExtractor {
    #[instrument(skip(self, raw_text), fields(provider = self.provider.provider_name()))]
    async fn extract(&self, raw_text: &str) -> Result<StructuredMapping> {
        let prompt = Prompt::new(SYSTEM_PROMPT, extraction_prompt(raw_text));

        let completion = self
            .provider
            .complete(&prompt, &self.params)
            .await
            .map_err(|e| QueryGraphError::Extraction(format!("{:#}", e)))?;
        info!(
            "Extraction response from {} ({} tokens)",
            completion.model,
            completion.total_tokens().unwrap_or_default()
        );

        let body = strip_code_fences(&completion.text);
        debug!("Extraction payload: {} bytes", body.len());

        StructuredMapping::from_json(body).map_err(|e| match e {
            QueryGraphError::InvalidMapping(reason) => QueryGraphError::Extraction(reason),
            other => other,
        })
    }
}

/// Removes a surrounding markdown code fence (```json ... ``` or ``` ... ```).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string, e.g. "json"
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches("json"),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}
