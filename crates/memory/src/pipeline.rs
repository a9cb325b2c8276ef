//! Background task handler tying detection, deduplication and relationship
//! discovery together.

use std::sync::Arc;

use async_trait::async_trait;
use mnemos_common::Result;
use tracing::debug;

use crate::dedup::{DedupOutcome, DeduplicationEngine};
use crate::detector::Detector;
use crate::processor::{TaskHandler, TaskOutcome};
use crate::relationship::RelationshipEngine;
use crate::store::EmbeddingStore;
use crate::task::{MemoryTask, TaskPayload};
use crate::types::{CandidateMemory, PendingMemory};

pub struct MemoryPipeline {
    detector: Arc<Detector>,
    store: Arc<EmbeddingStore>,
    dedup: Arc<DeduplicationEngine>,
    relationships: Arc<RelationshipEngine>,
}

impl MemoryPipeline {
    pub fn new(
        detector: Arc<Detector>,
        store: Arc<EmbeddingStore>,
        dedup: Arc<DeduplicationEngine>,
        relationships: Arc<RelationshipEngine>,
    ) -> Self {
        Self {
            detector,
            store,
            dedup,
            relationships,
        }
    }

    /// Validates, embeds and deduplicates one candidate.
    pub async fn store_candidate(
        &self,
        owner_id: &str,
        candidate: CandidateMemory,
        source_conversation_id: Option<String>,
        source_message_id: Option<String>,
    ) -> Result<DedupOutcome> {
        candidate.validate()?;
        let embedding = self.store.embed(&candidate.content).await?;
        let pending = PendingMemory::new(owner_id, candidate, embedding)
            .with_source(source_conversation_id, source_message_id);
        self.dedup.resolve_and_apply(pending).await
    }

    /// Folds one dedup result into `outcome`. A duplicate of a memory that
    /// never got its edges (an earlier attempt failed before its follow-ups
    /// were queued) asks for relationship discovery again.
    fn record(&self, outcome: &mut TaskOutcome, result: DedupOutcome) {
        match result {
            DedupOutcome::Inserted { memory_id, .. } => {
                outcome.follow_ups.push(TaskPayload::Relate {
                    memory_id: memory_id.clone(),
                });
                outcome.memory_ids.push(memory_id);
            }
            DedupOutcome::Merged { memory_id } => outcome.memory_ids.push(memory_id),
            DedupOutcome::Discarded {
                existing_id: Some(memory_id),
                ..
            } => {
                if self.store.relationships_for(&memory_id).is_ok_and(|edges| edges.is_empty()) {
                    outcome.follow_ups.push(TaskPayload::Relate { memory_id });
                }
            }
            DedupOutcome::Discarded { existing_id: None, .. } => {}
        }
    }
}

#[async_trait]
impl TaskHandler for MemoryPipeline {
    async fn handle(&self, task: &MemoryTask) -> Result<TaskOutcome> {
        let mut outcome = TaskOutcome::default();
        match &task.payload {
            TaskPayload::Detect(request) => {
                let candidates = self.detector.try_detect(request).await?;
                debug!(task_id = %task.id, candidates = candidates.len(), "Storing detected candidates");
                for candidate in candidates {
                    let result = self
                        .store_candidate(
                            &request.owner_id,
                            candidate,
                            request.source_conversation_id.clone(),
                            request.source_message_id.clone(),
                        )
                        .await?;
                    self.record(&mut outcome, result);
                }
            }
            TaskPayload::Store {
                owner_id,
                candidate,
                source_conversation_id,
                source_message_id,
            } => {
                let result = self
                    .store_candidate(
                        owner_id,
                        candidate.clone(),
                        source_conversation_id.clone(),
                        source_message_id.clone(),
                    )
                    .await?;
                self.record(&mut outcome, result);
            }
            TaskPayload::Relate { memory_id } => {
                let edges = self.relationships.discover_relationships(memory_id)?;
                if !edges.is_empty() {
                    outcome.memory_ids.push(memory_id.clone());
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, DetectorConfig, RelationshipConfig};
    use crate::detector::{DetectionRequest, KeywordClassifier};
    use crate::embedding::HashEmbedder;
    use crate::monitor::PerformanceMonitor;
    use crate::types::MemoryCategory;
    use mnemos_common::MnemosError;
    use mnemos_llm::EmbeddingClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Hash embeddings, except that one call in the sequence fails.
    struct OutageEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl EmbeddingClient for OutageEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(MnemosError::EmbeddingUnavailable("provider outage".into()));
            }
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_name(&self) -> &str {
            "outage"
        }
    }

    fn pipeline() -> (Arc<EmbeddingStore>, MemoryPipeline) {
        pipeline_with(Arc::new(HashEmbedder::new(256)))
    }

    fn pipeline_with(embedder: Arc<dyn EmbeddingClient>) -> (Arc<EmbeddingStore>, MemoryPipeline) {
        let monitor = Arc::new(PerformanceMonitor::new(100));
        let store = Arc::new(EmbeddingStore::new(
            embedder,
            monitor.clone(),
            Duration::from_secs(1),
        ));
        let detector = Arc::new(Detector::new(
            Arc::new(KeywordClassifier::new()),
            monitor,
            DetectorConfig::default(),
        ));
        let dedup = Arc::new(DeduplicationEngine::new(store.clone(), DedupConfig::default()));
        let relationships = Arc::new(RelationshipEngine::new(store.clone(), RelationshipConfig::default()));
        (store.clone(), MemoryPipeline::new(detector, store, dedup, relationships))
    }

    #[tokio::test]
    async fn detect_task_stores_and_requests_relations() {
        let (store, pipeline) = pipeline();
        let request = DetectionRequest::new("alice", "My name is Dana. I prefer morning workouts.")
            .with_source(Some("conv_1".into()), Some("msg_7".into()));
        let outcome = pipeline
            .handle(&TaskPayload::Detect(request).into_task())
            .await
            .unwrap();

        assert_eq!(outcome.memory_ids.len(), 2);
        assert_eq!(outcome.follow_ups.len(), 2);
        let stored = store.list_by_owner("alice");
        assert!(stored.iter().all(|m| m.source_message_id.as_deref() == Some("msg_7")));
        assert!(stored.iter().any(|m| m.category == MemoryCategory::PersonalInfo));
    }

    #[tokio::test]
    async fn repeated_detect_is_idempotent() {
        let (store, pipeline) = pipeline();
        let task = TaskPayload::Detect(DetectionRequest::new("alice", "I prefer morning workouts")).into_task();
        pipeline.handle(&task).await.unwrap();
        let second = pipeline.handle(&task).await.unwrap();
        assert!(second.memory_ids.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn store_task_rejects_invalid_candidates() {
        let (_store, pipeline) = pipeline();
        let task = TaskPayload::Store {
            owner_id: "alice".into(),
            candidate: CandidateMemory::new("tiny", MemoryCategory::Context, 0.5),
            source_conversation_id: None,
            source_message_id: None,
        }
        .into_task();
        assert!(pipeline.handle(&task).await.is_err());
    }

    #[tokio::test]
    async fn relate_task_for_deleted_memory_succeeds() {
        let (_store, pipeline) = pipeline();
        let task = TaskPayload::Relate {
            memory_id: "mem_gone".into(),
        }
        .into_task();
        assert_eq!(pipeline.handle(&task).await.unwrap(), TaskOutcome::default());
    }

    #[tokio::test]
    async fn retry_after_partial_detect_still_relates_earlier_candidates() {
        let embedder = OutageEmbedder {
            inner: HashEmbedder::new(256),
            calls: AtomicUsize::new(0),
            fail_on: 2,
        };
        let (store, pipeline) = pipeline_with(Arc::new(embedder));
        let task = TaskPayload::Detect(DetectionRequest::new("alice", "My name is Dana. I prefer morning workouts."))
            .into_task();

        let err = pipeline.handle(&task).await.unwrap_err();
        assert!(err.is_backend_failure());
        let stored = store.list_by_owner("alice");
        assert_eq!(stored.len(), 1);

        let retry = pipeline.handle(&task).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(retry.memory_ids.len(), 1);
        assert_eq!(retry.follow_ups.len(), 2);
        assert!(retry.follow_ups.contains(&TaskPayload::Relate {
            memory_id: stored[0].id.clone()
        }));
    }
}
