//! Provider-neutral completion interface used by the mapping extractor.

use async_trait::async_trait;
use querygraph_core::LLMConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub type LLMResult<T> = anyhow::Result<T>;

/// Sampling settings sent with every extraction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: usize,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 2000,
            stop: Vec::new(),
        }
    }
}

impl From<&LLMConfig> for SamplingParams {
    fn from(config: &LLMConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stop: Vec::new(),
        }
    }
}

/// A single-turn request: instructions plus the document to work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: Option<usize>,
    pub output_tokens: Option<usize>,
    pub stop_reason: Option<String>,
}

impl Completion {
    pub fn total_tokens(&self) -> Option<usize> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or_default() + output.unwrap_or_default()),
        }
    }
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, prompt: &Prompt, params: &SamplingParams) -> LLMResult<Completion>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Outcome of one HTTP attempt. Only transient failures are retried.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

impl AttemptError {
    /// 408, 429 and 5xx are worth another attempt; other statuses are not.
    pub fn from_status(status: reqwest::StatusCode, error: anyhow::Error) -> Self {
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            AttemptError::Transient(error)
        } else {
            AttemptError::Permanent(error)
        }
    }
}

/// Delay before retry `attempt` (1-based): 1s, 2s, 4s, ...
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt.saturating_sub(1)))
}

/// Runs `attempt` up to `max_retries + 1` times with exponential backoff.
pub(crate) async fn with_retries<T, F, Fut>(
    provider: &str,
    max_retries: u32,
    mut attempt: F,
) -> LLMResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Permanent(e)) => return Err(e),
            Err(AttemptError::Transient(e)) if tries >= max_retries => return Err(e),
            Err(AttemptError::Transient(e)) => {
                tries += 1;
                warn!(
                    "{} request failed (attempt {}/{}): {:#}",
                    provider,
                    tries,
                    max_retries + 1,
                    e
                );
                tokio::time::sleep(backoff_delay(tries)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(1).as_secs(), 1);
        assert_eq!(backoff_delay(2).as_secs(), 2);
        assert_eq!(backoff_delay(3).as_secs(), 4);
    }

    #[test]
    fn test_status_classification() {
        let transient = AttemptError::from_status(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            anyhow::anyhow!("busy"),
        );
        assert!(matches!(transient, AttemptError::Transient(_)));

        let permanent =
            AttemptError::from_status(reqwest::StatusCode::UNAUTHORIZED, anyhow::anyhow!("key"));
        assert!(matches!(permanent, AttemptError::Permanent(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = with_retries("test", 3, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AttemptError::Transient(anyhow::anyhow!("overloaded")))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let result: LLMResult<()> = with_retries("test", 3, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AttemptError::Permanent(anyhow::anyhow!("invalid key")))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_total_tokens() {
        let completion = Completion {
            text: String::new(),
            model: "m".to_string(),
            input_tokens: Some(10),
            output_tokens: None,
            stop_reason: None,
        };
        assert_eq!(completion.total_tokens(), Some(10));
    }
}
