//! Insert / merge / discard decisions for new memories.
//!
//! The engine compares a pending memory against the owner's most similar
//! existing memories. It never computes embeddings; callers supply them.

use std::collections::HashMap;
use std::sync::Arc;

use mnemos_common::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::facts::{merge_facts, split_into_facts};
use crate::store::{EmbeddingStore, ScoredMemory};
use crate::text::{extract_keywords, merge_keywords, normalize, normalize_keywords};
use crate::types::{
    AtomicFact, ContradictionFlag, Memory, MemoryMutation, PendingMemory, MAX_CONTENT_CHARS,
    MAX_KEYWORDS,
};

#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    /// Store as a new memory. `contradiction` names a close existing match
    /// that should get a `contradicts` edge.
    Insert {
        memory: Memory,
        contradiction: Option<ContradictionFlag>,
    },
    /// Fold the new facts into an existing memory.
    Merge {
        existing_id: String,
        merged_content: String,
        importance: f32,
        keywords: Vec<String>,
        /// Facts the candidate contributed
        added_facts: Vec<String>,
        similarity: f32,
    },
    /// Nothing to store.
    Discard {
        reason: String,
        existing_id: Option<String>,
    },
}

/// What [`DeduplicationEngine::apply`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DedupOutcome {
    Inserted {
        memory_id: String,
        contradicts: Option<String>,
    },
    Merged {
        memory_id: String,
    },
    Discarded {
        reason: String,
        existing_id: Option<String>,
    },
}

impl DedupOutcome {
    /// The memory now holding the content, if any.
    pub fn memory_id(&self) -> Option<&str> {
        match self {
            DedupOutcome::Inserted { memory_id, .. } | DedupOutcome::Merged { memory_id } => {
                Some(memory_id)
            }
            DedupOutcome::Discarded { existing_id, .. } => existing_id.as_deref(),
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, DedupOutcome::Inserted { .. })
    }
}

pub struct DeduplicationEngine {
    store: Arc<EmbeddingStore>,
    config: DedupConfig,
    owner_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeduplicationEngine {
    pub fn new(store: Arc<EmbeddingStore>, config: DedupConfig) -> Self {
        Self {
            store,
            config,
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Decides what to do with `pending`. Read-only.
    pub fn resolve(&self, pending: &PendingMemory) -> Result<DedupDecision> {
        let candidate = &pending.candidate;
        candidate.validate()?;

        let matches = self.store.similarity_search(
            &pending.owner_id,
            &pending.embedding,
            self.config.top_k,
            f32::NEG_INFINITY,
        )?;

        let normalized = normalize(&candidate.content);
        if let Some(exact) = matches.iter().find(|m| normalize(&m.memory.content) == normalized) {
            return Ok(DedupDecision::Discard {
                reason: "exact duplicate".into(),
                existing_id: Some(exact.memory.id.clone()),
            });
        }

        // Matches are ordered by score then recency, so the first qualifying
        // one is the tie-break winner.
        let merge_target = matches
            .iter()
            .find(|m| m.score >= self.config.merge_threshold && m.memory.category == candidate.category);
        if let Some(target) = merge_target {
            return Ok(self.merge_decision(pending, target));
        }

        let insert = self.build_memory(pending);
        let contradiction = matches
            .first()
            .filter(|best| best.score >= self.config.contradiction_threshold)
            .map(|best| ContradictionFlag {
                memory_id: insert.id.clone(),
                other_id: best.memory.id.clone(),
                similarity: best.score,
            });

        Ok(DedupDecision::Insert {
            memory: insert,
            contradiction,
        })
    }

    fn merge_decision(&self, pending: &PendingMemory, target: &ScoredMemory) -> DedupDecision {
        let existing = &target.memory;
        match merge_facts(&existing.content, &pending.candidate.content, MAX_CONTENT_CHARS) {
            Some(merged) => DedupDecision::Merge {
                existing_id: existing.id.clone(),
                merged_content: merged.content,
                importance: existing.importance.max(pending.candidate.importance),
                keywords: merge_keywords(&existing.keywords, &candidate_keywords(pending)),
                added_facts: merged.added,
                similarity: target.score,
            },
            None => DedupDecision::Discard {
                reason: "no new facts".into(),
                existing_id: Some(existing.id.clone()),
            },
        }
    }

    fn build_memory(&self, pending: &PendingMemory) -> Memory {
        let candidate = &pending.candidate;
        Memory::new(
            pending.owner_id.clone(),
            candidate.content.trim(),
            candidate.category,
            candidate.importance,
            pending.embedding.clone(),
        )
        .with_keywords(candidate_keywords(pending))
        .with_source(
            pending.source_conversation_id.clone(),
            pending.source_message_id.clone(),
        )
    }

    /// Performs the writes for `decision`.
    pub fn apply(&self, decision: DedupDecision) -> Result<DedupOutcome> {
        match decision {
            DedupDecision::Insert {
                memory,
                contradiction,
            } => {
                let facts: Vec<AtomicFact> = split_into_facts(&memory.content)
                    .into_iter()
                    .map(|statement| AtomicFact::new(&memory.id, statement, 1.0))
                    .collect();
                let memory_id = self.store.put(memory)?;
                self.store.add_facts(&memory_id, facts)?;

                let contradicts = contradiction.map(|flag| {
                    let other = flag.other_id.clone();
                    self.store.flag_contradiction(flag);
                    other
                });
                info!(memory_id = %memory_id, contradicts = ?contradicts, "Inserted memory");
                Ok(DedupOutcome::Inserted {
                    memory_id,
                    contradicts,
                })
            }
            DedupDecision::Merge {
                existing_id,
                merged_content,
                importance,
                keywords,
                added_facts,
                similarity,
            } => {
                let statements = split_into_facts(&merged_content);
                self.store.update(
                    &existing_id,
                    MemoryMutation {
                        content: Some(merged_content),
                        importance: Some(importance),
                        keywords: Some(keywords),
                        ..Default::default()
                    },
                )?;
                // confidence that a merged-in fact belongs here is the match score
                let facts = added_facts
                    .into_iter()
                    .map(|statement| AtomicFact::new(&existing_id, statement, similarity))
                    .collect();
                // facts replaced by a more detailed statement are gone from the content
                self.store
                    .retain_facts(&existing_id, |f| statements.contains(&f.statement));
                self.store.add_facts(&existing_id, facts)?;
                info!(memory_id = %existing_id, similarity, "Merged into existing memory");
                Ok(DedupOutcome::Merged {
                    memory_id: existing_id,
                })
            }
            DedupDecision::Discard {
                reason,
                existing_id,
            } => {
                debug!(reason = %reason, existing_id = ?existing_id, "Discarded candidate");
                Ok(DedupOutcome::Discarded {
                    reason,
                    existing_id,
                })
            }
        }
    }

    /// `resolve` then `apply`, serialized per owner so two concurrent writes
    /// of the same content cannot both insert.
    pub async fn resolve_and_apply(&self, pending: PendingMemory) -> Result<DedupOutcome> {
        let lock = self.owner_lock(&pending.owner_id);
        let result = {
            let _guard = lock.lock().await;
            self.resolve(&pending).and_then(|decision| self.apply(decision))
        };
        self.release_owner_lock(&pending.owner_id, lock);
        result
    }

    fn owner_lock(&self, owner_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.owner_locks
            .lock()
            .entry(owner_id.to_string())
            .or_default()
            .clone()
    }

    /// Forgets the owner's lock once no other writer holds or waits on it.
    fn release_owner_lock(&self, owner_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.owner_locks.lock();
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(owner_id);
        }
    }
}

fn candidate_keywords(pending: &PendingMemory) -> Vec<String> {
    let keywords = normalize_keywords(&pending.candidate.keywords);
    if keywords.is_empty() {
        extract_keywords(&pending.candidate.content, MAX_KEYWORDS)
    } else {
        keywords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::monitor::PerformanceMonitor;
    use crate::types::{CandidateMemory, MemoryCategory};
    use mnemos_common::MnemosError;
    use std::time::Duration;

    fn engine() -> (Arc<EmbeddingStore>, DeduplicationEngine) {
        let store = Arc::new(EmbeddingStore::new(
            Arc::new(HashEmbedder::new(2)),
            Arc::new(PerformanceMonitor::new(100)),
            Duration::from_secs(1),
        ));
        let engine = DeduplicationEngine::new(store.clone(), DedupConfig::default());
        (store, engine)
    }

    /// Unit vector at `cos` similarity to [1, 0].
    fn at_similarity(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    fn pending(owner: &str, content: &str, category: MemoryCategory, importance: f32, embedding: Vec<f32>) -> PendingMemory {
        PendingMemory::new(owner, CandidateMemory::new(content, category, importance), embedding)
    }

    fn seed_a(store: &EmbeddingStore) -> String {
        store
            .put(
                Memory::new("alice", "I prefer morning workouts", MemoryCategory::Preference, 0.6, vec![1.0, 0.0])
                    .with_keywords(vec!["morning".into(), "workouts".into()]),
            )
            .unwrap()
    }

    #[test]
    fn near_duplicate_same_category_merges_into_existing() {
        let (store, engine) = engine();
        let a = seed_a(&store);

        let b = pending(
            "alice",
            "I like working out in the mornings",
            MemoryCategory::Preference,
            0.5,
            at_similarity(0.94),
        );
        match engine.resolve(&b).unwrap() {
            DedupDecision::Merge {
                existing_id,
                merged_content,
                importance,
                keywords,
                ..
            } => {
                assert_eq!(existing_id, a);
                assert_eq!(
                    merged_content,
                    "I prefer morning workouts. I like working out in the mornings"
                );
                assert!((importance - 0.6).abs() < f32::EPSILON);
                assert_eq!(keywords[..2], ["morning".to_string(), "workouts".to_string()]);
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn merge_threshold_never_inserts_across_scores() {
        let (store, engine) = engine();
        seed_a(&store);
        for cos in [0.93f32, 0.95, 0.99, 1.0] {
            let p = pending(
                "alice",
                "I stretch for ten minutes before running",
                MemoryCategory::Preference,
                0.9,
                at_similarity(cos),
            );
            let decision = engine.resolve(&p).unwrap();
            assert!(
                !matches!(decision, DedupDecision::Insert { .. }),
                "similarity {cos} produced an insert"
            );
        }
    }

    #[test]
    fn merge_applies_max_importance_and_facts() {
        let (store, engine) = engine();
        let a = seed_a(&store);

        let b = pending(
            "alice",
            "I stretch for ten minutes before running",
            MemoryCategory::Preference,
            0.9,
            at_similarity(0.95),
        );
        let outcome = engine.apply(engine.resolve(&b).unwrap()).unwrap();
        assert_eq!(outcome, DedupOutcome::Merged { memory_id: a.clone() });

        let merged = store.get(&a).unwrap();
        assert!((merged.importance - 0.9).abs() < f32::EPSILON);
        assert!(merged.content.ends_with("I stretch for ten minutes before running"));
        assert_eq!(store.facts_for(&a).len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn refinement_replaces_the_fact_it_elaborates() {
        let (store, engine) = engine();
        let first = pending("alice", "I prefer morning workouts", MemoryCategory::Preference, 0.6, vec![1.0, 0.0]);
        let DedupOutcome::Inserted { memory_id: a, .. } = engine.apply(engine.resolve(&first).unwrap()).unwrap() else {
            panic!("expected an insert");
        };

        let detail = pending(
            "alice",
            "I prefer morning workouts on weekends at the lake",
            MemoryCategory::Preference,
            0.6,
            at_similarity(0.95),
        );
        let outcome = engine.apply(engine.resolve(&detail).unwrap()).unwrap();
        assert_eq!(outcome, DedupOutcome::Merged { memory_id: a.clone() });

        assert_eq!(store.get(&a).unwrap().content, "I prefer morning workouts on weekends at the lake");
        let facts = store.facts_for(&a);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].statement, "I prefer morning workouts on weekends at the lake");
    }

    #[test]
    fn different_category_at_high_similarity_flags_contradiction() {
        let (store, engine) = engine();
        let a = seed_a(&store);

        let p = pending(
            "alice",
            "Never schedule my workouts in the morning",
            MemoryCategory::Instruction,
            0.7,
            at_similarity(0.95),
        );
        match engine.resolve(&p).unwrap() {
            DedupDecision::Insert {
                contradiction: Some(flag),
                memory,
            } => {
                assert_eq!(flag.other_id, a);
                assert_eq!(flag.memory_id, memory.id);
            }
            other => panic!("expected flagged insert, got {other:?}"),
        }
    }

    #[test]
    fn middle_band_inserts_with_flag_and_low_band_inserts_clean() {
        let (store, engine) = engine();
        let a = seed_a(&store);

        let mid = pending("alice", "I hate evening workouts", MemoryCategory::Preference, 0.5, at_similarity(0.8));
        let outcome = engine.apply(engine.resolve(&mid).unwrap()).unwrap();
        let DedupOutcome::Inserted { memory_id, contradicts } = outcome else {
            panic!("expected insert");
        };
        assert_eq!(contradicts.as_deref(), Some(a.as_str()));
        assert_eq!(store.flags_for(&memory_id).len(), 1);
        assert!(!store.facts_for(&memory_id).is_empty());

        let low = pending("alice", "My sister lives in Oslo", MemoryCategory::PersonalInfo, 0.5, vec![0.0, 1.0]);
        match engine.resolve(&low).unwrap() {
            DedupDecision::Insert { contradiction, memory } => {
                assert!(contradiction.is_none());
                assert_eq!(memory.keywords, vec!["sister", "lives", "oslo"]);
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn exact_text_match_is_discarded() {
        let (store, engine) = engine();
        let a = seed_a(&store);
        let p = pending("alice", "i prefer morning workouts!", MemoryCategory::Preference, 0.5, at_similarity(0.3));
        assert_eq!(
            engine.resolve(&p).unwrap(),
            DedupDecision::Discard {
                reason: "exact duplicate".into(),
                existing_id: Some(a)
            }
        );
    }

    #[test]
    fn other_owners_are_invisible() {
        let (store, engine) = engine();
        seed_a(&store);
        let p = pending("bob", "I prefer morning workouts", MemoryCategory::Preference, 0.5, vec![1.0, 0.0]);
        assert!(matches!(
            engine.resolve(&p).unwrap(),
            DedupDecision::Insert { contradiction: None, .. }
        ));
    }

    #[test]
    fn ties_prefer_most_recently_updated() {
        let (store, engine) = engine();
        let older = seed_a(&store);
        std::thread::sleep(Duration::from_millis(5));
        let newer = store
            .put(Memory::new("alice", "I prefer evening swims", MemoryCategory::Preference, 0.5, vec![1.0, 0.0]))
            .unwrap();
        assert_ne!(older, newer);

        let p = pending("alice", "I do yoga on weekends", MemoryCategory::Preference, 0.5, vec![1.0, 0.0]);
        match engine.resolve(&p).unwrap() {
            DedupDecision::Merge { existing_id, .. } => assert_eq!(existing_id, newer),
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn invalid_candidate_is_rejected() {
        let (_store, engine) = engine();
        let p = pending("alice", "short", MemoryCategory::Preference, 0.5, vec![1.0, 0.0]);
        assert!(matches!(engine.resolve(&p), Err(MnemosError::Validation(_))));
    }

    #[tokio::test]
    async fn concurrent_identical_writes_store_once() {
        let (store, engine) = engine();
        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let p = pending("alice", "I prefer morning workouts", MemoryCategory::Preference, 0.6, vec![1.0, 0.0]);
                engine.resolve_and_apply(p).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap().is_inserted() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn owner_locks_are_released_after_writes() {
        let (store, engine) = engine();
        let engine = Arc::new(engine);

        let writes: Vec<_> = ["alice", "bob", "alice", "carol"]
            .into_iter()
            .enumerate()
            .map(|(i, owner)| {
                let engine = engine.clone();
                let content = format!("I prefer option number {i}");
                tokio::spawn(async move {
                    let p = pending(owner, &content, MemoryCategory::Preference, 0.5, vec![1.0, 0.0]);
                    engine.resolve_and_apply(p).await
                })
            })
            .collect();
        for write in writes {
            write.await.unwrap().unwrap();
        }

        assert_eq!(engine.owner_locks.lock().len(), 0);
        assert_eq!(store.list_by_owner("bob").len(), 1);
        assert_eq!(store.list_by_owner("carol").len(), 1);
    }
}
