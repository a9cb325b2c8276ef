use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mnemos_common::{MnemosError, Result};
use serde::{Deserialize, Serialize};

use crate::client::{LlmClient, LlmRequest, LlmResponse};
use crate::openai::OpenAiClient;
use crate::retry::{RetryConfig, RetryingClient};

/// Completion backend settings, usually the `[llm]` table of the service config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Only `"openai"` (any OpenAI-compatible server) is supported.
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent() -> usize {
    2
}

impl LlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model: model.into(),
            api_key: None,
            api_url: None,
            temperature: None,
            max_tokens: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_concurrent_requests: default_max_concurrent(),
            retry: RetryConfig::default(),
        }
    }

    /// Explicit key first, then `MNEMOS_LLM_API_KEY`, then `OPENAI_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), &["MNEMOS_LLM_API_KEY", "OPENAI_API_KEY"])
    }
}

/// Returns `explicit` if set and non-empty, else the first non-empty env var.
pub fn resolve_api_key(explicit: Option<&str>, env_vars: &[&str]) -> Option<String> {
    explicit
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .or_else(|| {
            env_vars
                .iter()
                .filter_map(|var| std::env::var(var).ok())
                .find(|v| !v.is_empty())
        })
}

/// Caps in-flight requests to the wrapped client.
pub struct SemaphoredClient {
    inner: Arc<dyn LlmClient>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl SemaphoredClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl LlmClient for SemaphoredClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| MnemosError::BackendUnavailable(format!("Semaphore closed: {e}")))?;
        self.inner.complete(request).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Provider client wrapped in retry and a concurrency cap.
pub fn build_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let base_client: Box<dyn LlmClient> = match config.provider.as_str() {
        "openai" => Box::new(OpenAiClient::with_timeout(
            config.api_url.clone(),
            config.model.clone(),
            config.resolve_api_key(),
            Some(Duration::from_millis(config.request_timeout_ms)),
        )),
        other => {
            return Err(MnemosError::Config(format!("Unknown LLM provider: {other}")));
        }
    };

    let retrying: Box<dyn LlmClient> =
        Box::new(RetryingClient::new(base_client, config.retry.clone()));

    Ok(Arc::new(SemaphoredClient::new(
        Arc::from(retrying),
        config.max_concurrent_requests,
    )))
}
