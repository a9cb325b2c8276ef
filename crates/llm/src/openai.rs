//! Clients for OpenAI-compatible HTTP endpoints (OpenAI, Ollama, vLLM, ...).

use std::time::Duration;

use async_trait::async_trait;
use mnemos_common::{MnemosError, Result};
use serde::{Deserialize, Serialize};

use crate::client::{LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};
use crate::embedding::EmbeddingClient;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    model: String,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Base URL, credentials and HTTP client shared by both endpoint kinds.
#[derive(Clone)]
struct Endpoint {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl Endpoint {
    fn new(base_url: Option<String>, api_key: Option<String>, timeout: Option<Duration>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            http_client: builder.build().unwrap_or_default(),
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> std::result::Result<reqwest::Response, String> {
        let url = format!("{}{}", self.base_url, path);
        let mut http_req = self.http_client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| format!("request to {url} failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(format!("API error {status}: {body_text}"));
        }
        Ok(response)
    }
}

/// Chat completion client.
pub struct OpenAiClient {
    endpoint: Endpoint,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, model: String, api_key: Option<String>) -> Self {
        Self::with_timeout(base_url, model, api_key, None)
    }

    pub fn with_timeout(
        base_url: Option<String>,
        model: String,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(base_url, api_key, timeout),
            model,
        }
    }

    fn role_to_string(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_request_body(&self, request: &LlmRequest) -> ChatRequest {
        let system = request.system_prompt.iter().map(|s| WireMessage {
            role: "system".to_string(),
            content: s.clone(),
        });
        let turns = request.messages.iter().map(|msg| WireMessage {
            role: Self::role_to_string(msg.role).to_string(),
            content: msg.content.clone(),
        });

        ChatRequest {
            model: self.model.clone(),
            messages: system.chain(turns).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_output.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request_body(&request);

        let response = self
            .endpoint
            .post("/v1/chat/completions", &body)
            .await
            .map_err(|e| MnemosError::BackendUnavailable(format!("completion {e}")))?;

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            MnemosError::BackendUnavailable(format!("Failed to parse completion response: {e}"))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            MnemosError::BackendUnavailable("No choices in completion response".to_string())
        })?;

        Ok(LlmResponse {
            content: choice.message.content,
            model: parsed.model,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Embedding client for the `/v1/embeddings` route.
pub struct OpenAiEmbeddingClient {
    endpoint: Endpoint,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddingClient {
    pub fn new(
        base_url: Option<String>,
        model: String,
        api_key: Option<String>,
        dimension: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(base_url, api_key, timeout),
            model,
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| MnemosError::EmbeddingUnavailable("Empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };
        let response = self
            .endpoint
            .post("/v1/embeddings", &body)
            .await
            .map_err(|e| MnemosError::EmbeddingUnavailable(format!("embedding {e}")))?;

        let mut parsed: EmbeddingsResponse = response.json().await.map_err(|e| {
            MnemosError::EmbeddingUnavailable(format!("Failed to parse embedding response: {e}"))
        })?;

        if parsed.data.len() != texts.len() {
            return Err(MnemosError::EmbeddingUnavailable(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(MnemosError::EmbeddingUnavailable(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                bad.len()
            )));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
