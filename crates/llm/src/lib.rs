//! Provider clients for the capabilities Mnemos consumes: chat completion
//! (memory classification) and text embedding.

pub mod client;
pub mod config;
pub mod embedding;
pub mod openai;
pub mod retry;

pub use client::{ChatMessage, LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};
pub use config::{build_llm_client, resolve_api_key, LlmConfig, SemaphoredClient};
pub use embedding::EmbeddingClient;
pub use openai::{OpenAiClient, OpenAiEmbeddingClient};
pub use retry::{RetryConfig, RetryingClient};
