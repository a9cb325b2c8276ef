//! Memory retrieval with context building.
//!
//! Retrieval runs in three tiers:
//! 1. a similarity pool of `pool_multiplier * limit` memories from the store
//! 2. a contextual re-rank mixing similarity with keyword overlap, category
//!    affinity to the inferred intent, recency and importance
//! 3. collapse of near-duplicates, keeping the higher-ranked memory

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use mnemos_common::{now_millis, MnemosError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::cosine_similarity;
use crate::monitor::{components, PerformanceMonitor};
use crate::store::EmbeddingStore;
use crate::text::{content_terms, stem};
use crate::types::{Memory, MemoryCategory};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// A ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedMemory {
    pub memory: Memory,
    /// Cosine similarity to the query
    pub similarity: f32,
    /// Final re-ranked score
    pub score: f32,
}

static INTENT_CUES: Lazy<Vec<(MemoryCategory, Regex)>> = Lazy::new(|| {
    let table: [(MemoryCategory, &str); 4] = [
        (
            MemoryCategory::Preference,
            r"(?i)\b(prefer\w*|like|likes|love|favou?rites?|enjoy\w*|tastes?|dislike\w*|hate)\b",
        ),
        (
            MemoryCategory::PersonalInfo,
            r"(?i)\b(my name|name|birthday|born|live|lives|family|sister|brother|wife|husband|partner|age|about me)\b",
        ),
        (
            MemoryCategory::Instruction,
            r"(?i)\b(always|never|instructions?|rules?|format|tone|style|respond|reply)\b",
        ),
        (
            MemoryCategory::Context,
            r"(?i)\b(working on|projects?|plan\w*|deadlines?|schedul\w*|currently|this week|today)\b",
        ),
    ];
    table
        .into_iter()
        .filter_map(|(category, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((category, re)),
            Err(e) => {
                warn!(category = %category, error = %e, "Invalid intent pattern skipped");
                None
            }
        })
        .collect()
});

/// Category the query is most likely asking about, by cue count. Ties go to
/// the earlier category in the cue table.
pub fn infer_intent(query: &str, hints: &[String]) -> Option<MemoryCategory> {
    let text = format!("{} {}", query, hints.join(" "));
    let mut best: Option<(MemoryCategory, usize)> = None;
    for (category, re) in INTENT_CUES.iter() {
        let hits = re.find_iter(&text).count();
        if hits > 0 && best.map_or(true, |(_, n)| hits > n) {
            best = Some((*category, hits));
        }
    }
    best.map(|(category, _)| category)
}

/// Fraction of `terms` present in the memory's content or keywords.
fn keyword_overlap(terms: &HashSet<String>, memory: &Memory) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let mut memory_terms = content_terms(&memory.content);
    memory_terms.extend(memory.keywords.iter().map(|k| stem(k)));
    terms.intersection(&memory_terms).count() as f32 / terms.len() as f32
}

fn category_affinity(intent: Option<MemoryCategory>, category: MemoryCategory) -> f32 {
    match intent {
        Some(intent) if intent == category => 1.0,
        Some(_) => 0.0,
        None => 0.5,
    }
}

/// Exponential decay on time since the last update.
fn recency_weight(now: u64, updated_at: u64, half_life_days: f64) -> f32 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    let age_days = now.saturating_sub(updated_at) as f64 / MILLIS_PER_DAY;
    0.5f64.powf(age_days / half_life_days) as f32
}

/// Score desc, then importance desc, then newest first.
fn compare_ranked(a: &RetrievedMemory, b: &RetrievedMemory) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.memory.importance.total_cmp(&a.memory.importance))
        .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
        .then_with(|| a.memory.id.cmp(&b.memory.id))
}

/// Retrieves and formats memories for prompt context.
pub struct RetrievalEngine {
    store: Arc<EmbeddingStore>,
    monitor: Arc<PerformanceMonitor>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<EmbeddingStore>, monitor: Arc<PerformanceMonitor>, config: RetrievalConfig) -> Self {
        Self {
            store,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// The owner's memories most relevant to `query`, best first. Never
    /// fails; errors are logged and yield an empty list.
    pub async fn retrieve(&self, owner_id: &str, query: &str, hints: &[String], limit: usize) -> Vec<Memory> {
        match self.try_retrieve(owner_id, query, hints, limit).await {
            Ok(results) => results.into_iter().map(|r| r.memory).collect(),
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Retrieval failed, continuing without memories");
                Vec::new()
            }
        }
    }

    /// Ranked results with scores. `limit` of 0 uses the configured default.
    pub async fn try_retrieve(
        &self,
        owner_id: &str,
        query: &str,
        hints: &[String],
        limit: usize,
    ) -> Result<Vec<RetrievedMemory>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MnemosError::validation("query must not be empty"));
        }
        let limit = match limit {
            0 => self.config.default_limit,
            n => n.min(self.config.max_limit),
        };

        self.monitor
            .observe(components::RETRIEVAL, self.rank(owner_id, query, hints, limit))
            .await
    }

    async fn rank(&self, owner_id: &str, query: &str, hints: &[String], limit: usize) -> Result<Vec<RetrievedMemory>> {
        // Tier 1: similarity pool
        let vector = self.store.embed(query).await?;
        let pool = self.store.similarity_search(
            owner_id,
            &vector,
            limit.saturating_mul(self.config.pool_multiplier.max(1)),
            self.config.min_similarity,
        )?;
        let pool_size = pool.len();

        // Tier 2: contextual re-rank
        let intent = infer_intent(query, hints);
        let mut terms: HashSet<String> = hints.iter().flat_map(|h| content_terms(h)).collect();
        if terms.is_empty() {
            terms = content_terms(query);
        }
        let now = now_millis();
        let w = &self.config.weights;

        let mut ranked: Vec<RetrievedMemory> = pool
            .into_iter()
            .map(|hit| {
                let score = w.similarity * hit.score
                    + w.keyword * keyword_overlap(&terms, &hit.memory)
                    + w.category * category_affinity(intent, hit.memory.category)
                    + w.recency * recency_weight(now, hit.memory.updated_at, self.config.recency_half_life_days)
                    + w.importance * hit.memory.importance;
                RetrievedMemory {
                    similarity: hit.score,
                    score,
                    memory: hit.memory,
                }
            })
            .collect();
        ranked.sort_by(compare_ranked);

        // Tier 3: near-duplicate collapse
        let mut results: Vec<RetrievedMemory> = Vec::with_capacity(limit);
        for candidate in ranked {
            if results.len() == limit {
                break;
            }
            let duplicate = results.iter().any(|kept| {
                cosine_similarity(&kept.memory.embedding, &candidate.memory.embedding)
                    >= self.config.duplicate_threshold
            });
            if !duplicate {
                results.push(candidate);
            }
        }

        debug!(
            owner_id = %owner_id,
            pool = pool_size,
            returned = results.len(),
            intent = ?intent,
            "Retrieved memories"
        );
        Ok(results)
    }

    /// Renders relevant memories as a prompt section, stopping at the token
    /// budget. Empty when nothing relevant is stored.
    pub async fn build_context(&self, owner_id: &str, query: &str, hints: &[String]) -> String {
        let memories = self.retrieve(owner_id, query, hints, self.config.default_limit).await;

        let mut context_parts = Vec::new();
        let mut token_count = 0;
        for memory in &memories {
            let part = format_memory(memory);
            let tokens = estimate_tokens(&part);
            if token_count + tokens > self.config.max_context_tokens {
                break;
            }
            context_parts.push(part);
            token_count += tokens;
        }

        if context_parts.is_empty() {
            return String::new();
        }

        debug!(
            memory_count = context_parts.len(),
            estimated_tokens = token_count,
            "Built memory context"
        );
        format!(
            "## Relevant Context from Memory\n\n{}",
            context_parts.join("\n\n")
        )
    }
}

fn format_memory(memory: &Memory) -> String {
    let label = match memory.category {
        MemoryCategory::Preference => "Preference",
        MemoryCategory::PersonalInfo => "Personal",
        MemoryCategory::Context => "Context",
        MemoryCategory::Instruction => "Instruction",
    };
    format!("**[{}]** {}", label, memory.content)
}

fn estimate_tokens(text: &str) -> usize {
    // Rough estimate: ~4 chars per token
    text.len() / 4
}
