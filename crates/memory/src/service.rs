//! The assembled memory system.
//!
//! `MemoryService` owns one instance of every component and is the only
//! type the chat collaborator and the HTTP layer talk to. There is no global
//! state; build as many independent services as needed.

use std::path::Path;
use std::sync::Arc;

use mnemos_common::{MnemosError, Result};
use mnemos_llm::EmbeddingClient;
use serde::Serialize;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::config::MemoryConfig;
use crate::dedup::{DedupOutcome, DeduplicationEngine};
use crate::detector::{Classifier, DetectionRequest, Detector};
use crate::monitor::{ComponentStats, PerformanceMonitor};
use crate::pipeline::MemoryPipeline;
use crate::processor::{BackgroundProcessor, ProcessorStats, TaskHandle};
use crate::relationship::RelationshipEngine;
use crate::retrieval::{RetrievalEngine, RetrievedMemory};
use crate::store::{EmbeddingStore, StoreStats};
use crate::task::{MemoryTask, TaskPayload};
use crate::types::{CandidateMemory, Memory, Relationship};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub store: StoreStats,
    pub processor: ProcessorStats,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub components: Vec<ComponentStats>,
    pub embedding_model: String,
    pub classifier: String,
}

pub struct MemoryService {
    config: MemoryConfig,
    store: Arc<EmbeddingStore>,
    monitor: Arc<PerformanceMonitor>,
    detector: Arc<Detector>,
    retrieval: RetrievalEngine,
    relationships: Arc<RelationshipEngine>,
    pipeline: Arc<MemoryPipeline>,
    processor: BackgroundProcessor,
    embedding_model: String,
}

impl MemoryService {
    /// Wires the components. Workers are not running until [`start`](Self::start).
    pub fn new(
        config: MemoryConfig,
        embedder: Arc<dyn EmbeddingClient>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let embedding_model = embedder.model_name().to_string();
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.max_samples));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let store = Arc::new(EmbeddingStore::new(embedder, monitor.clone(), config.call_timeout()));

        let detector = Arc::new(Detector::new(classifier, monitor.clone(), config.detector.clone()));
        let dedup = Arc::new(DeduplicationEngine::new(store.clone(), config.dedup.clone()));
        let relationships = Arc::new(RelationshipEngine::new(store.clone(), config.relationships.clone()));
        let retrieval = RetrievalEngine::new(store.clone(), monitor.clone(), config.retrieval.clone());
        let pipeline = Arc::new(MemoryPipeline::new(
            detector.clone(),
            store.clone(),
            dedup,
            relationships.clone(),
        ));
        let processor = BackgroundProcessor::new(config.processor.clone(), breaker, monitor.clone());

        Self {
            config,
            store,
            monitor,
            detector,
            retrieval,
            relationships,
            pipeline,
            processor,
            embedding_model,
        }
    }

    /// Like [`new`](Self::new), then restores the snapshot at `data_path`
    /// when one exists.
    pub async fn open(
        config: MemoryConfig,
        embedder: Arc<dyn EmbeddingClient>,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self> {
        config.validate()?;
        let service = Self::new(config, embedder, classifier);
        if let Some(path) = service.config.data_path.as_deref() {
            if path.exists() {
                let restored = service.store.load_snapshot(path).await?;
                info!(path = %path.display(), memories = restored, "Restored memory snapshot");
            }
        }
        Ok(service)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn start(&self) {
        self.processor.start(self.pipeline.clone());
    }

    /// Stops the workers and writes the snapshot when `data_path` is set.
    pub async fn shutdown(&self) -> Result<()> {
        self.processor.shutdown().await;
        self.save_snapshot().await
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        match self.config.data_path.as_deref() {
            Some(path) => self.save_snapshot_to(path).await,
            None => Ok(()),
        }
    }

    pub async fn save_snapshot_to(&self, path: &Path) -> Result<()> {
        self.store.save_snapshot(path).await?;
        info!(path = %path.display(), memories = self.store.len(), "Saved memory snapshot");
        Ok(())
    }

    /// Queues detection for a chat turn and returns immediately.
    pub fn observe_turn(&self, request: DetectionRequest) -> Result<TaskHandle> {
        if request.owner_id.trim().is_empty() {
            return Err(MnemosError::validation("owner_id must not be empty"));
        }
        if request.message.trim().is_empty() {
            return Err(MnemosError::validation("message must not be empty"));
        }
        Ok(self.enqueue(TaskPayload::Detect(request).into_task()))
    }

    /// Queues a single already-detected candidate for storage.
    pub fn submit_candidate(
        &self,
        owner_id: &str,
        candidate: CandidateMemory,
        source_conversation_id: Option<String>,
        source_message_id: Option<String>,
    ) -> Result<TaskHandle> {
        candidate.validate()?;
        let payload = TaskPayload::Store {
            owner_id: owner_id.to_string(),
            candidate,
            source_conversation_id,
            source_message_id,
        };
        Ok(self.enqueue(payload.into_task()))
    }

    pub fn enqueue(&self, task: MemoryTask) -> TaskHandle {
        self.processor.enqueue(task)
    }

    /// Cancels a queued task of `owner_id` that has not started. Another
    /// owner's task is treated as unknown.
    pub fn cancel_task(&self, owner_id: &str, task_id: &str) -> bool {
        let Some(task) = self.processor.task(task_id) else {
            return false;
        };
        let task_owner = match &task.payload {
            TaskPayload::Relate { memory_id } => self.store.get(memory_id).ok().map(|m| m.owner_id),
            payload => payload.owner_id().map(str::to_string),
        };
        if task_owner.as_deref() != Some(owner_id) {
            return false;
        }
        self.processor.cancel(task_id)
    }

    pub fn failed_tasks(&self) -> Vec<MemoryTask> {
        self.processor.failed_tasks()
    }

    /// Synchronous detection with no persistence. Never fails.
    pub async fn detect(&self, request: &DetectionRequest) -> Vec<CandidateMemory> {
        self.detector.detect(request).await
    }

    /// Stores a user-submitted memory right away. A duplicate of an existing
    /// memory returns that memory; a merge returns the merged record.
    pub async fn insert_manual(&self, owner_id: &str, candidate: CandidateMemory) -> Result<Memory> {
        if owner_id.trim().is_empty() {
            return Err(MnemosError::validation("owner_id must not be empty"));
        }
        let outcome = self.pipeline.store_candidate(owner_id, candidate, None, None).await?;
        match outcome {
            DedupOutcome::Inserted { memory_id, .. } => {
                self.enqueue(
                    TaskPayload::Relate {
                        memory_id: memory_id.clone(),
                    }
                    .into_task(),
                );
                self.store.get(&memory_id)
            }
            DedupOutcome::Merged { memory_id } => self.store.get(&memory_id),
            DedupOutcome::Discarded {
                existing_id: Some(id),
                ..
            } => self.store.get(&id),
            DedupOutcome::Discarded {
                reason,
                existing_id: None,
            } => Err(MnemosError::validation(reason)),
        }
    }

    /// Relevant memories for prompt assembly. Never fails.
    pub async fn retrieve(&self, owner_id: &str, query: &str, hints: &[String], limit: usize) -> Vec<Memory> {
        self.retrieval.retrieve(owner_id, query, hints, limit).await
    }

    /// Scored results for the search endpoint. Malformed queries are errors;
    /// backend failures degrade to an empty list.
    pub async fn search(
        &self,
        owner_id: &str,
        query: &str,
        hints: &[String],
        limit: usize,
    ) -> Result<Vec<RetrievedMemory>> {
        match self.retrieval.try_retrieve(owner_id, query, hints, limit).await {
            Ok(results) => Ok(results),
            Err(e @ MnemosError::Validation(_)) => Err(e),
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Search degraded to empty result");
                Ok(Vec::new())
            }
        }
    }

    pub async fn build_context(&self, owner_id: &str, query: &str, hints: &[String]) -> String {
        self.retrieval.build_context(owner_id, query, hints).await
    }

    /// A memory owned by `owner_id`. Other owners' memories are reported as
    /// not found.
    pub fn get(&self, owner_id: &str, memory_id: &str) -> Result<Memory> {
        let memory = self.store.get(memory_id)?;
        if memory.owner_id != owner_id {
            return Err(MnemosError::not_found(memory_id));
        }
        Ok(memory)
    }

    pub fn list(&self, owner_id: &str) -> Vec<Memory> {
        self.store.list_by_owner(owner_id)
    }

    /// Deletes a memory along with its facts and relationships.
    pub fn delete(&self, owner_id: &str, memory_id: &str) -> Result<Memory> {
        self.get(owner_id, memory_id)?;
        let removed = self.store.delete(memory_id)?;
        info!(memory_id = %memory_id, "Memory deleted");
        Ok(removed)
    }

    pub fn relationships(&self, owner_id: &str, memory_id: &str) -> Result<Vec<Relationship>> {
        self.get(owner_id, memory_id)?;
        self.relationships.relationships_for(memory_id)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            store: self.store.stats(),
            processor: self.processor.stats(),
            circuit_breaker: self.processor.breaker().snapshot(),
            components: self.monitor.snapshot(),
            embedding_model: self.embedding_model.clone(),
            classifier: self.detector.classifier_name().to_string(),
        }
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }
}
