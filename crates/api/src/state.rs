//! Application state for the API server.

use std::sync::Arc;

use mnemos_llm::{build_llm_client, EmbeddingClient};
use mnemos_memory::embedding::build_embedder;
use mnemos_memory::{Classifier, KeywordClassifier, LlmClassifier, MemoryService};
use tracing::{info, warn};

use crate::config::AppConfig;

/// Shared application state for the API server.
pub struct AppState {
    pub memory: MemoryService,

    /// Server start time (for health checks)
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Builds the memory service from configuration, restores its snapshot
    /// and starts the background workers.
    pub async fn from_config(config: &AppConfig) -> mnemos_common::Result<Self> {
        let embedder = build_embedder(&config.embedding, config.memory.call_timeout())?;
        // a failed load is retried on the first embedding call
        if let Err(e) = embedder.warmup().await {
            warn!(error = %e, model = embedder.model_name(), "Embedding warmup failed");
        }
        let classifier: Arc<dyn Classifier> = match &config.llm {
            Some(llm) => Arc::new(LlmClassifier::new(build_llm_client(llm)?)),
            None => {
                info!("No [llm] section, using keyword classifier");
                Arc::new(KeywordClassifier::new())
            }
        };
        let memory = MemoryService::open(config.memory.clone(), embedder, classifier).await?;
        Ok(Self::new(memory))
    }

    /// Wraps an existing service and starts its workers.
    pub fn new(memory: MemoryService) -> Self {
        memory.start();
        Self {
            memory,
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
