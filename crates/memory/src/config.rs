//! Tunables for every stage of the memory pipeline.
//!
//! All thresholds here are product-tuning constants; every field has a
//! default so a config file only needs to name what it changes.

use std::path::PathBuf;
use std::time::Duration;

use mnemos_common::{MnemosError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the memory system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub relationships: RelationshipConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Upper bound on a single embedding call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Snapshot file loaded at startup and written on shutdown
    #[serde(default)]
    pub data_path: Option<PathBuf>,
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            dedup: DedupConfig::default(),
            retrieval: RetrievalConfig::default(),
            relationships: RelationshipConfig::default(),
            processor: ProcessorConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            monitor: MonitorConfig::default(),
            call_timeout_ms: default_call_timeout_ms(),
            data_path: None,
        }
    }
}

impl MemoryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Rejects settings the pipeline cannot honour: similarity thresholds
    /// outside [0, 1], a contradiction band above the merge threshold,
    /// negative or non-finite ranking weights, and zero attempts or
    /// breaker threshold.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("dedup.merge_threshold", self.dedup.merge_threshold),
            ("dedup.contradiction_threshold", self.dedup.contradiction_threshold),
            ("retrieval.min_similarity", self.retrieval.min_similarity),
            ("retrieval.duplicate_threshold", self.retrieval.duplicate_threshold),
            ("relationships.relation_threshold", self.relationships.relation_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(MnemosError::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.dedup.contradiction_threshold > self.dedup.merge_threshold {
            return Err(MnemosError::Config(format!(
                "dedup.contradiction_threshold ({}) must not exceed dedup.merge_threshold ({})",
                self.dedup.contradiction_threshold, self.dedup.merge_threshold
            )));
        }

        let w = &self.retrieval.weights;
        let weights = [
            ("similarity", w.similarity),
            ("keyword", w.keyword),
            ("category", w.category),
            ("recency", w.recency),
            ("importance", w.importance),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(MnemosError::Config(format!(
                    "retrieval.weights.{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !(self.retrieval.recency_half_life_days.is_finite() && self.retrieval.recency_half_life_days > 0.0) {
            return Err(MnemosError::Config("retrieval.recency_half_life_days must be positive".into()));
        }

        if self.processor.max_attempts == 0 {
            return Err(MnemosError::Config("processor.max_attempts must be at least 1".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(MnemosError::Config("circuit_breaker.failure_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Upper bound on a single classification call
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Prior turns passed to the classifier, most recent kept
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,

    #[serde(default = "default_max_history_chars")]
    pub max_history_chars: usize,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

fn default_detector_timeout_ms() -> u64 {
    5_000
}

fn default_max_message_chars() -> usize {
    2_000
}

fn default_max_history_turns() -> usize {
    6
}

fn default_max_history_chars() -> usize {
    500
}

fn default_max_candidates() -> usize {
    5
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_detector_timeout_ms(),
            max_message_chars: default_max_message_chars(),
            max_history_turns: default_max_history_turns(),
            max_history_chars: default_max_history_chars(),
            max_candidates: default_max_candidates(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Existing memories compared against each candidate
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// At or above: same-category candidates merge into the match
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f32,

    /// At or above (and below merge): insert and flag a contradiction
    #[serde(default = "default_contradiction_threshold")]
    pub contradiction_threshold: f32,
}

fn default_top_k() -> usize {
    5
}

fn default_merge_threshold() -> f32 {
    0.92
}

fn default_contradiction_threshold() -> f32 {
    0.75
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            merge_threshold: default_merge_threshold(),
            contradiction_threshold: default_contradiction_threshold(),
        }
    }
}

/// Tier 2 score weights. They need not sum to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub similarity: f32,
    pub keyword: f32,
    pub category: f32,
    pub recency: f32,
    pub importance: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            similarity: 0.55,
            keyword: 0.15,
            category: 0.15,
            recency: 0.05,
            importance: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Tier 1 pool size as a multiple of the requested limit
    #[serde(default = "default_pool_multiplier")]
    pub pool_multiplier: usize,

    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    /// Tier 3: results at least this similar to a higher-ranked one are dropped
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,

    #[serde(default)]
    pub weights: RankingWeights,

    #[serde(default = "default_half_life_days")]
    pub recency_half_life_days: f64,

    /// Budget for [`crate::retrieval::RetrievalEngine::build_context`]
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

fn default_limit() -> usize {
    5
}

fn default_max_limit() -> usize {
    50
}

fn default_pool_multiplier() -> usize {
    3
}

fn default_min_similarity() -> f32 {
    0.3
}

fn default_duplicate_threshold() -> f32 {
    0.95
}

fn default_half_life_days() -> f64 {
    30.0
}

fn default_max_context_tokens() -> usize {
    1_000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            pool_multiplier: default_pool_multiplier(),
            min_similarity: default_min_similarity(),
            duplicate_threshold: default_duplicate_threshold(),
            weights: RankingWeights::default(),
            recency_half_life_days: default_half_life_days(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    #[serde(default = "default_relation_threshold")]
    pub relation_threshold: f32,

    /// Edges created per discovery run, contradictions included
    #[serde(default = "default_max_edges")]
    pub max_edges: usize,
}

fn default_relation_threshold() -> f32 {
    0.80
}

fn default_max_edges() -> usize {
    5
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            relation_threshold: default_relation_threshold(),
            max_edges: default_max_edges(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Exhausted tasks kept for inspection
    #[serde(default = "default_failed_log_capacity")]
    pub failed_log_capacity: usize,
}

fn default_workers() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_failed_log_capacity() -> usize {
    100
}

impl ProcessorConfig {
    /// Delay before retrying after `attempts` failed executions.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            failed_log_capacity: default_failed_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time spent open before a single trial is allowed
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Samples retained per component
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

fn default_max_samples() -> usize {
    1_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_samples: default_max_samples(),
        }
    }
}
