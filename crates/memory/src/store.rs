//! Memory storage with vector similarity search.
//!
//! Records live in an in-memory arena keyed by id; relationships are an edge
//! list of ids. Every mutation is a single write-lock critical section, so
//! writes are atomic per record. Durability is an optional JSON snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mnemos_common::{now_millis, MnemosError, Result};
use mnemos_llm::EmbeddingClient;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::embedding::cosine_similarity;
use crate::monitor::{components, PerformanceMonitor};
use crate::types::{
    validate_content, validate_importance, AtomicFact, ContradictionFlag, Memory, MemoryMutation,
    Relationship, MAX_CONTENT_CHARS,
};

const SNAPSHOT_VERSION: u32 = 1;

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    /// Cosine similarity to the query vector
    pub score: f32,
}

#[derive(Default)]
struct StoreInner {
    memories: HashMap<String, Memory>,
    facts: HashMap<String, Vec<AtomicFact>>,
    relationships: Vec<Relationship>,
    flags: Vec<ContradictionFlag>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimension: usize,
    memories: Vec<Memory>,
    facts: Vec<AtomicFact>,
    relationships: Vec<Relationship>,
    flags: Vec<ContradictionFlag>,
}

/// Counts reported by [`EmbeddingStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub memories: usize,
    pub facts: usize,
    pub relationships: usize,
    pub pending_flags: usize,
}

pub struct EmbeddingStore {
    embedder: Arc<dyn EmbeddingClient>,
    monitor: Arc<PerformanceMonitor>,
    call_timeout: Duration,
    inner: RwLock<StoreInner>,
}

impl EmbeddingStore {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        monitor: Arc<PerformanceMonitor>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            monitor,
            call_timeout,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Length every stored embedding must have.
    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Embeds `text` with the configured provider, bounded by the call
    /// timeout. Every failure surfaces as `EmbeddingUnavailable`.
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let timeout = self.call_timeout;
        let dimension = self.dimension();
        self.monitor
            .observe(components::EMBEDDING, async {
                let vector = match tokio::time::timeout(timeout, self.embedder.embed(text)).await {
                    Ok(Ok(vector)) => vector,
                    Ok(Err(MnemosError::EmbeddingUnavailable(msg))) => {
                        return Err(MnemosError::EmbeddingUnavailable(msg))
                    }
                    Ok(Err(e)) => return Err(MnemosError::EmbeddingUnavailable(e.to_string())),
                    Err(_) => {
                        return Err(MnemosError::EmbeddingUnavailable(format!(
                            "embedding timed out after {}ms",
                            timeout.as_millis()
                        )))
                    }
                };
                if vector.len() != dimension {
                    return Err(MnemosError::EmbeddingUnavailable(format!(
                        "provider returned {} dimensions, store expects {}",
                        vector.len(),
                        dimension
                    )));
                }
                Ok(vector)
            })
            .await
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension() {
            return Err(MnemosError::validation(format!(
                "embedding has {} dimensions, store expects {}",
                vector.len(),
                self.dimension()
            )));
        }
        Ok(())
    }

    pub fn put(&self, memory: Memory) -> Result<String> {
        memory.validate()?;
        self.check_dimension(&memory.embedding)?;

        let mut inner = self.inner.write();
        if inner.memories.contains_key(&memory.id) {
            return Err(MnemosError::validation(format!("memory {} already exists", memory.id)));
        }
        let id = memory.id.clone();
        debug!(memory_id = %id, owner_id = %memory.owner_id, category = %memory.category, "Storing memory");
        inner.memories.insert(id.clone(), memory);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Memory> {
        self.inner
            .read()
            .memories
            .get(id)
            .cloned()
            .ok_or_else(|| MnemosError::not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().memories.contains_key(id)
    }

    /// The `k` memories of `owner_id` most similar to `vector`, by descending
    /// score. Scores below `min_similarity` are excluded. Equal scores
    /// prefer the most recently updated memory.
    pub fn similarity_search(
        &self,
        owner_id: &str,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredMemory>> {
        self.check_dimension(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.read();
        let mut hits: Vec<ScoredMemory> = inner
            .memories
            .values()
            .filter(|m| m.owner_id == owner_id)
            .filter_map(|m| {
                let score = cosine_similarity(vector, &m.embedding);
                (score >= min_similarity).then(|| ScoredMemory {
                    memory: m.clone(),
                    score,
                })
            })
            .collect();
        drop(inner);

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Applies `mutation` and bumps `updated_at`. Returns the new record.
    pub fn update(&self, id: &str, mutation: MemoryMutation) -> Result<Memory> {
        if let Some(ref content) = mutation.content {
            validate_content(content, 1, MAX_CONTENT_CHARS)?;
        }
        if let Some(importance) = mutation.importance {
            validate_importance(importance)?;
        }
        if let Some(ref embedding) = mutation.embedding {
            self.check_dimension(embedding)?;
        }

        let mut inner = self.inner.write();
        let memory = inner
            .memories
            .get_mut(id)
            .ok_or_else(|| MnemosError::not_found(id))?;

        if let Some(content) = mutation.content {
            memory.content = content;
        }
        if let Some(category) = mutation.category {
            memory.category = category;
        }
        if let Some(importance) = mutation.importance {
            memory.importance = importance;
        }
        if let Some(keywords) = mutation.keywords {
            memory.keywords = keywords;
        }
        if let Some(embedding) = mutation.embedding {
            memory.embedding = embedding;
        }
        // strictly increasing so recency tie-breaks see every write
        memory.updated_at = now_millis().max(memory.updated_at + 1);
        debug!(memory_id = %id, "Updated memory");
        Ok(memory.clone())
    }

    /// Removes the memory with its facts, relationships and pending flags.
    pub fn delete(&self, id: &str) -> Result<Memory> {
        let mut inner = self.inner.write();
        let memory = inner
            .memories
            .remove(id)
            .ok_or_else(|| MnemosError::not_found(id))?;
        inner.facts.remove(id);
        inner.relationships.retain(|r| !r.touches(id));
        inner.flags.retain(|f| f.memory_id != id && f.other_id != id);
        info!(memory_id = %id, owner_id = %memory.owner_id, "Deleted memory");
        Ok(memory)
    }

    pub fn list_by_owner(&self, owner_id: &str) -> Vec<Memory> {
        let inner = self.inner.read();
        let mut memories: Vec<Memory> = inner
            .memories
            .values()
            .filter(|m| m.owner_id == owner_id)
            .cloned()
            .collect();
        memories.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        memories
    }

    pub fn len(&self) -> usize {
        self.inner.read().memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends facts to a memory.
    pub fn add_facts(&self, memory_id: &str, facts: Vec<AtomicFact>) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.memories.contains_key(memory_id) {
            return Err(MnemosError::not_found(memory_id));
        }
        if facts.iter().any(|f| f.memory_id != memory_id) {
            return Err(MnemosError::validation("fact belongs to a different memory"));
        }
        inner
            .facts
            .entry(memory_id.to_string())
            .or_default()
            .extend(facts);
        Ok(())
    }

    /// Drops the facts of `memory_id` that `keep` rejects.
    pub fn retain_facts(&self, memory_id: &str, keep: impl Fn(&AtomicFact) -> bool) {
        if let Some(facts) = self.inner.write().facts.get_mut(memory_id) {
            facts.retain(|f| keep(f));
        }
    }

    pub fn facts_for(&self, memory_id: &str) -> Vec<AtomicFact> {
        self.inner
            .read()
            .facts
            .get(memory_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Adds a directed edge. Both endpoints must exist and share an owner.
    /// An existing edge with the same endpoints and type is strengthened to
    /// the larger strength instead of duplicated.
    pub fn add_relationship(&self, relationship: Relationship) -> Result<Relationship> {
        if relationship.from_memory_id == relationship.to_memory_id {
            return Err(MnemosError::validation("relationship cannot point to itself"));
        }

        let mut inner = self.inner.write();
        let from_owner = inner
            .memories
            .get(&relationship.from_memory_id)
            .map(|m| m.owner_id.clone())
            .ok_or_else(|| MnemosError::not_found(&relationship.from_memory_id))?;
        let to_owner = inner
            .memories
            .get(&relationship.to_memory_id)
            .map(|m| m.owner_id.clone())
            .ok_or_else(|| MnemosError::not_found(&relationship.to_memory_id))?;
        if from_owner != to_owner {
            return Err(MnemosError::validation("relationship endpoints belong to different owners"));
        }

        if let Some(existing) = inner.relationships.iter_mut().find(|r| {
            r.from_memory_id == relationship.from_memory_id
                && r.to_memory_id == relationship.to_memory_id
                && r.relation_type == relationship.relation_type
        }) {
            existing.strength = existing.strength.max(relationship.strength);
            return Ok(existing.clone());
        }

        debug!(
            from = %relationship.from_memory_id,
            to = %relationship.to_memory_id,
            relation = relationship.relation_type.as_str(),
            "Adding relationship"
        );
        inner.relationships.push(relationship.clone());
        Ok(relationship)
    }

    /// Edges in either direction. `NotFound` if the memory does not exist.
    pub fn relationships_for(&self, memory_id: &str) -> Result<Vec<Relationship>> {
        let inner = self.inner.read();
        if !inner.memories.contains_key(memory_id) {
            return Err(MnemosError::not_found(memory_id));
        }
        Ok(inner
            .relationships
            .iter()
            .filter(|r| r.touches(memory_id))
            .cloned()
            .collect())
    }

    pub fn flag_contradiction(&self, flag: ContradictionFlag) {
        let mut inner = self.inner.write();
        let duplicate = inner
            .flags
            .iter()
            .any(|f| f.memory_id == flag.memory_id && f.other_id == flag.other_id);
        if !duplicate {
            inner.flags.push(flag);
        }
    }

    /// Flags raised for `memory_id` that have not been cleared.
    pub fn flags_for(&self, memory_id: &str) -> Vec<ContradictionFlag> {
        self.inner
            .read()
            .flags
            .iter()
            .filter(|f| f.memory_id == memory_id)
            .cloned()
            .collect()
    }

    pub fn clear_flags(&self, memory_id: &str) {
        self.inner.write().flags.retain(|f| f.memory_id != memory_id);
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            memories: inner.memories.len(),
            facts: inner.facts.values().map(Vec::len).sum(),
            relationships: inner.relationships.len(),
            pending_flags: inner.flags.len(),
        }
    }

    /// Writes the whole store as JSON via a temp file and rename, so readers
    /// never see a partial snapshot.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let inner = self.inner.read();
            Snapshot {
                version: SNAPSHOT_VERSION,
                dimension: self.dimension(),
                memories: inner.memories.values().cloned().collect(),
                facts: inner.facts.values().flatten().cloned().collect(),
                relationships: inner.relationships.clone(),
                flags: inner.flags.clone(),
            }
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(
            path = %path.display(),
            memories = snapshot.memories.len(),
            "Saved memory snapshot"
        );
        Ok(())
    }

    /// Replaces the store contents with a snapshot. Returns the number of
    /// memories loaded.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MnemosError::Storage(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.dimension != self.dimension() {
            return Err(MnemosError::Storage(format!(
                "snapshot has {}-dim embeddings, store expects {}",
                snapshot.dimension,
                self.dimension()
            )));
        }
        if let Some(bad) = snapshot.memories.iter().find(|m| m.embedding.len() != snapshot.dimension) {
            return Err(MnemosError::Storage(format!(
                "memory {} has a {}-dim embedding",
                bad.id,
                bad.embedding.len()
            )));
        }

        let mut fresh = StoreInner::default();
        for memory in snapshot.memories {
            fresh.memories.insert(memory.id.clone(), memory);
        }
        for fact in snapshot.facts {
            if fresh.memories.contains_key(&fact.memory_id) {
                fresh.facts.entry(fact.memory_id.clone()).or_default().push(fact);
            }
        }
        let (kept, dangling): (Vec<_>, Vec<_>) = snapshot.relationships.into_iter().partition(|r| {
            fresh.memories.contains_key(&r.from_memory_id) && fresh.memories.contains_key(&r.to_memory_id)
        });
        if !dangling.is_empty() {
            warn!(count = dangling.len(), "Dropping relationships with missing endpoints");
        }
        fresh.relationships = kept;
        fresh.flags = snapshot
            .flags
            .into_iter()
            .filter(|f| fresh.memories.contains_key(&f.memory_id) && fresh.memories.contains_key(&f.other_id))
            .collect();

        let count = fresh.memories.len();
        *self.inner.write() = fresh;
        info!(path = %path.display(), memories = count, "Loaded memory snapshot");
        Ok(count)
    }
}
