pub mod extractor;
pub mod llm_factory;
pub mod llm_provider;
pub mod prompt;

#[cfg(feature = "anthropic")]
pub mod anthropic_provider;
#[cfg(feature = "openai")]
pub mod openai_provider;

pub use extractor::*;
pub use llm_factory::*;
pub use llm_provider::*;

#[cfg(feature = "anthropic")]
pub use anthropic_provider::{AnthropicConfig, AnthropicProvider};
#[cfg(feature = "openai")]
pub use openai_provider::{OpenAIConfig, OpenAIProvider};
