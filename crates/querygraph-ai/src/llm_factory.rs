use crate::llm_provider::LLMProvider;
use anyhow::{anyhow, bail, Result};
use querygraph_core::LLMConfig;
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "anthropic")]
use crate::anthropic_provider::{AnthropicConfig, AnthropicProvider};

#[cfg(feature = "openai")]
use crate::openai_provider::{OpenAIConfig, OpenAIProvider};

/// Builds the provider named by `llm.provider`.
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    pub fn create_from_config(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let name = config.provider.trim().to_lowercase();
        debug!("Creating LLM provider '{}'", name);

        match name.as_str() {
            #[cfg(feature = "anthropic")]
            "anthropic" => Self::anthropic(config),
            #[cfg(feature = "openai")]
            "openai" => Self::openai(config),
            #[cfg(feature = "openai")]
            "openai-compatible" => Self::openai_compatible(config),
            _ => bail!(
                "Unsupported LLM provider: {}. Available providers: {}",
                name,
                Self::supported_providers().join(", ")
            ),
        }
    }

    /// Providers compiled into this build.
    pub fn supported_providers() -> Vec<&'static str> {
        let mut providers = Vec::new();
        #[cfg(feature = "anthropic")]
        providers.push("anthropic");
        #[cfg(feature = "openai")]
        providers.extend(["openai", "openai-compatible"]);
        providers
    }

    #[cfg(feature = "anthropic")]
    fn anthropic(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let key = key_or_env(&config.anthropic_api_key, "ANTHROPIC_API_KEY")
            .ok_or_else(|| anyhow!("Anthropic API key not found in config or ANTHROPIC_API_KEY"))?;

        let mut settings = AnthropicConfig::new(key);
        if let Some(model) = &config.model {
            settings.model = model.clone();
        }
        settings.timeout_secs = config.timeout_secs;
        settings.max_retries = config.max_retries;

        Ok(Arc::new(AnthropicProvider::new(settings)?))
    }

    #[cfg(feature = "openai")]
    fn openai(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let key = key_or_env(&config.openai_api_key, "OPENAI_API_KEY")
            .ok_or_else(|| anyhow!("OpenAI API key not found in config or OPENAI_API_KEY"))?;

        let mut settings = OpenAIConfig::hosted(key);
        settings.base_url = config.openai_base_url.clone();
        if let Some(model) = &config.model {
            settings.model = model.clone();
        }
        settings.timeout_secs = config.timeout_secs;
        settings.max_retries = config.max_retries;

        Ok(Arc::new(OpenAIProvider::new(settings)?))
    }

    #[cfg(feature = "openai")]
    fn openai_compatible(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let model = config
            .model
            .as_deref()
            .ok_or_else(|| anyhow!("llm.model is required for the openai-compatible provider"))?;

        let mut settings = OpenAIConfig::compatible(config.openai_base_url.as_str(), model);
        settings.api_key = config.openai_api_key.clone();
        settings.timeout_secs = config.timeout_secs;
        settings.max_retries = config.max_retries;

        Ok(Arc::new(OpenAIProvider::new(settings)?))
    }
}

#[cfg(any(feature = "anthropic", feature = "openai"))]
fn key_or_env(configured: &Option<String>, var: &str) -> Option<String> {
    configured
        .clone()
        .or_else(|| std::env::var(var).ok())
        .filter(|key| !key.trim().is_empty())
}
