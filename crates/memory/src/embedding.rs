//! Embedding providers and vector math.
//!
//! Three providers implement [`EmbeddingClient`]:
//!
//! - [`LocalEmbedder`]: fastembed model, lazily loaded on first use
//! - `mnemos_llm::OpenAiEmbeddingClient`: any OpenAI-compatible `/v1/embeddings`
//! - [`HashEmbedder`]: deterministic feature hashing, no model required
//!
//! [`build_embedder`] picks one from [`EmbeddingConfig`] at construction time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use mnemos_common::{MnemosError, Result};
use mnemos_llm::{resolve_api_key, EmbeddingClient, OpenAiEmbeddingClient, RetryConfig, RetryingClient};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task;
use tracing::{debug, info, instrument};

use crate::text::{content_terms, tokenize};

/// Errors from the local embedding model.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Failed to initialize embedding model: {0}")]
    ModelInit(String),

    #[error("Failed to generate embeddings: {0}")]
    Generation(String),

    #[error("Blocking task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl From<EmbeddingError> for MnemosError {
    fn from(err: EmbeddingError) -> Self {
        MnemosError::EmbeddingUnavailable(err.to_string())
    }
}

/// Known local models: config name, fastembed model, output dimension.
const LOCAL_MODELS: &[(&str, EmbeddingModel, usize)] = &[
    ("all-MiniLM-L6-v2", EmbeddingModel::AllMiniLML6V2, 384),
    ("all-MiniLM-L12-v2", EmbeddingModel::AllMiniLML12V2, 384),
    ("bge-small-en-v1.5", EmbeddingModel::BGESmallENV15, 384),
    ("bge-base-en-v1.5", EmbeddingModel::BGEBaseENV15, 768),
    ("bge-large-en-v1.5", EmbeddingModel::BGELargeENV15, 1024),
    ("nomic-embed-text-v1.5", EmbeddingModel::NomicEmbedTextV15, 768),
    ("multilingual-e5-small", EmbeddingModel::MultilingualE5Small, 384),
    ("multilingual-e5-base", EmbeddingModel::MultilingualE5Base, 768),
];

/// In-process embedding with fastembed.
///
/// The model is not loaded until the first embedding call (or
/// [`EmbeddingClient::warmup`]), then shared by every call.
pub struct LocalEmbedder {
    name: String,
    model_id: EmbeddingModel,
    dimension: usize,
    model: OnceCell<Arc<TextEmbedding>>,
}

impl LocalEmbedder {
    /// Returns an error if the model name is not recognized.
    pub fn from_model_str(model_name: &str) -> std::result::Result<Self, EmbeddingError> {
        let (name, model_id, dimension) = LOCAL_MODELS
            .iter()
            .find(|(name, _, _)| name.eq_ignore_ascii_case(model_name))
            .ok_or_else(|| {
                let known: Vec<&str> = LOCAL_MODELS.iter().map(|(n, _, _)| *n).collect();
                EmbeddingError::ModelInit(format!(
                    "Unknown embedding model '{model_name}'. Supported: {}",
                    known.join(", ")
                ))
            })?;

        Ok(Self {
            name: name.to_string(),
            model_id: model_id.clone(),
            dimension: *dimension,
            model: OnceCell::new(),
        })
    }

    /// Like [`from_model_str`](Self::from_model_str), also checking the
    /// configured dimension against the model's.
    pub fn from_config(model_name: &str, expected_dim: usize) -> std::result::Result<Self, EmbeddingError> {
        let embedder = Self::from_model_str(model_name)?;
        if embedder.dimension != expected_dim {
            return Err(EmbeddingError::ModelInit(format!(
                "Dimension mismatch: model '{}' produces {}-dim vectors but config specifies {}",
                model_name, embedder.dimension, expected_dim
            )));
        }
        Ok(embedder)
    }

    /// Whether the model has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// The shared model, loading it on first use. Download and session setup
    /// are blocking, so they run on the blocking pool.
    async fn model(&self) -> std::result::Result<Arc<TextEmbedding>, EmbeddingError> {
        self.model
            .get_or_try_init(|| async {
                let model_id = self.model_id.clone();
                let name = self.name.clone();
                let dimension = self.dimension;
                task::spawn_blocking(move || {
                    info!(model = %name, "Initializing embedding model");
                    let mut options = InitOptions::new(model_id);
                    options.show_download_progress = false;
                    let model = TextEmbedding::try_new(options)
                        .map_err(|e| EmbeddingError::ModelInit(e.to_string()))?;
                    info!(model = %name, dimension, "Embedding model initialized");
                    Ok::<_, EmbeddingError>(Arc::new(model))
                })
                .await?
            })
            .await
            .cloned()
    }

    async fn run_batch(&self, texts: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = self.model().await?;
        // fastembed is synchronous and CPU-bound
        let embeddings = task::spawn_blocking(move || {
            model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::Generation(e.to_string()))
        })
        .await??;
        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingClient for LocalEmbedder {
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self
            .run_batch(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Generation("Empty embedding result".into()))?;
        debug!(dimension = embedding.len(), "Generated embedding");
        Ok(embedding)
    }

    #[instrument(skip(self, texts), fields(batch_size = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.run_batch(texts.to_vec()).await?)
    }

    /// Loads the model now instead of on the first embedding call.
    async fn warmup(&self) -> Result<()> {
        if self.is_loaded() {
            debug!("Model already initialized, skipping warmup");
            return Ok(());
        }
        let start = std::time::Instant::now();
        self.model().await?;
        info!(model = %self.name, elapsed_ms = start.elapsed().as_millis() as u64, "Model warmup complete");
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// Feature-hashing embedder: each stemmed content term adds a signed unit
/// to one bucket, then the vector is L2-normalized. Texts sharing terms get
/// positive similarity; identical texts get 1.0. Output is stable across
/// processes, so snapshots stay comparable.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut terms: Vec<String> = content_terms(text).into_iter().collect();
        if terms.is_empty() {
            terms = tokenize(text);
        }
        terms.sort_unstable();

        let mut vector = vec![0.0f32; self.dimension];
        for term in &terms {
            let hash = fnv1a(term.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut vector {
                *val /= norm;
            }
        } else {
            // every text must embed to a usable vector
            vector[0] = 1.0;
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "feature-hash"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Local,
    #[serde(rename = "openai")]
    OpenAi,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,

    /// Model name for `local` and `openai`
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,

    pub api_url: Option<String>,

    /// Falls back to `MNEMOS_EMBEDDING_API_KEY`, then `OPENAI_API_KEY`
    pub api_key: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Local
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".into()
}

fn default_embedding_dim() -> usize {
    384 // MiniLM dimension
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dimension: default_embedding_dim(),
            api_url: None,
            api_key: None,
            retry: RetryConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn hash(dimension: usize) -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            dimension,
            ..Default::default()
        }
    }
}

pub fn build_embedder(config: &EmbeddingConfig, call_timeout: Duration) -> Result<Arc<dyn EmbeddingClient>> {
    let embedder: Arc<dyn EmbeddingClient> = match config.provider {
        EmbeddingProvider::Local => Arc::new(
            LocalEmbedder::from_config(&config.model, config.dimension)
                .map_err(|e| MnemosError::Config(e.to_string()))?,
        ),
        EmbeddingProvider::OpenAi => {
            let api_key = resolve_api_key(
                config.api_key.as_deref(),
                &["MNEMOS_EMBEDDING_API_KEY", "OPENAI_API_KEY"],
            );
            let client = OpenAiEmbeddingClient::new(
                config.api_url.clone(),
                config.model.clone(),
                api_key,
                config.dimension,
                Some(call_timeout),
            );
            Arc::new(RetryingClient::new(client, config.retry.clone()))
        }
        EmbeddingProvider::Hash => Arc::new(HashEmbedder::new(config.dimension)),
    };
    info!(
        provider = ?config.provider,
        model = embedder.model_name(),
        dimension = embedder.dimension(),
        "Embedding provider ready"
    );
    Ok(embedder)
}

/// Cosine similarity in [-1, 1]. Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}
