//! End-to-end tests for the memory service.
//!
//! Everything runs offline: the feature-hash embedder or a fixed vector
//! table stands in for a real embedding model, and classifiers are either
//! the keyword classifier or small doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mnemos_common::{MnemosError, Result};
use mnemos_llm::EmbeddingClient;
use mnemos_memory::config::DetectorConfig;
use mnemos_memory::{
    CandidateMemory, CircuitState, Classifier, DetectionRequest, HashEmbedder, KeywordClassifier, MemoryCategory,
    MemoryConfig, MemoryService,
};
use serde_json::{json, Value};
use tempfile::TempDir;

struct TableEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    fn new(entries: &[(&str, [f32; 3])]) -> Self {
        Self {
            vectors: entries.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for TableEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectors.get(text).cloned().unwrap_or_else(|| vec![0.0, 0.0, 1.0]))
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "table"
    }
}

/// Never answers within the detector timeout.
struct StalledClassifier {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Classifier for StalledClassifier {
    async fn classify(&self, _text: &str, _schema_hint: &str) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!({ "memories": [] }))
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

fn hash_service() -> MemoryService {
    MemoryService::new(
        MemoryConfig::default(),
        Arc::new(HashEmbedder::new(256)),
        Arc::new(KeywordClassifier::new()),
    )
}

#[tokio::test]
async fn test_near_duplicate_preferences_merge() {
    let embedder = TableEmbedder::new(&[
        ("I prefer morning workouts", [1.0, 0.0, 0.0]),
        ("I like working out in the mornings", [0.94, 0.3412, 0.0]),
    ]);
    let service = MemoryService::new(
        MemoryConfig::default(),
        Arc::new(embedder),
        Arc::new(KeywordClassifier::new()),
    );

    let first = service
        .insert_manual("alice", CandidateMemory::new("I prefer morning workouts", MemoryCategory::Preference, 0.6))
        .await
        .unwrap();
    let merged = service
        .insert_manual(
            "alice",
            CandidateMemory::new("I like working out in the mornings", MemoryCategory::Preference, 0.7),
        )
        .await
        .unwrap();

    assert_eq!(merged.id, first.id);
    assert_eq!(merged.content, "I prefer morning workouts. I like working out in the mornings");
    assert!((merged.importance - 0.7).abs() < 1e-6);
    assert_eq!(service.list("alice").len(), 1);
    assert_eq!(service.stats().store.facts, 2);
}

#[tokio::test]
async fn test_preference_query_returns_preferences() {
    let service = hash_service();
    let memories = [
        ("I prefer morning workouts", MemoryCategory::Preference),
        ("I like short interval workouts", MemoryCategory::Preference),
        ("I enjoy stretching after workouts", MemoryCategory::Preference),
        ("I'm working on a quarterly report", MemoryCategory::Context),
        ("I'm planning a trip to Lisbon", MemoryCategory::Context),
    ];
    for (content, category) in memories {
        service
            .insert_manual("alice", CandidateMemory::new(content, category, 0.5))
            .await
            .unwrap();
    }
    assert_eq!(service.list("alice").len(), 5);

    let results = service.retrieve("alice", "workout preferences", &[], 5).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|m| m.category == MemoryCategory::Preference));

    let context = service.build_context("alice", "workout preferences", &[]).await;
    assert!(context.starts_with("## Relevant Context from Memory"));
    assert!(context.contains("**[Preference]** I prefer morning workouts"));
    assert!(!context.contains("Lisbon"));
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_detector_timeouts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = MemoryConfig {
        detector: DetectorConfig {
            timeout_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    };
    assert_eq!(config.processor.max_attempts, 3);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    let service = MemoryService::new(
        config,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(StalledClassifier { calls: calls.clone() }),
    );
    service.start();

    for i in 0..5u32 {
        let request = DetectionRequest::new("alice", format!("I prefer option number {i}"));
        let handle = service.observe_turn(request).unwrap();
        assert!(matches!(handle.wait().await, Err(MnemosError::TaskExhausted { attempts: 3, .. })));

        let breaker = service.stats().circuit_breaker;
        if i < 4 {
            assert_eq!(breaker.state, CircuitState::Closed, "opened after {} failed tasks", i + 1);
            assert_eq!(breaker.failure_count, i + 1);
        }
    }

    let stats = service.stats();
    assert_eq!(stats.circuit_breaker.state, CircuitState::Open);
    assert_eq!(stats.processor.failed, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 15);

    let sixth = service
        .observe_turn(DetectionRequest::new("alice", "I prefer option number 5"))
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), sixth.wait()).await.is_err());
    assert!(service.stats().processor.deferred >= 1);
    assert_eq!(calls.load(Ordering::SeqCst), 15);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_turns_are_stored_once() {
    let service = hash_service();
    let request = DetectionRequest::new("alice", "My sister lives in Oslo");

    let first = service.observe_turn(request.clone()).unwrap();
    let second = service.observe_turn(request.clone()).unwrap();
    service.start();

    let a = first.wait().await.unwrap();
    let b = second.wait().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(service.stats().processor.coalesced, 1);

    // the same turn processed again later is absorbed by deduplication
    service.observe_turn(request).unwrap().wait().await.unwrap();
    assert_eq!(service.list("alice").len(), 1);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let service = hash_service();
    let alice = service
        .insert_manual("alice", CandidateMemory::new("I prefer green tea", MemoryCategory::Preference, 0.6))
        .await
        .unwrap();
    let bob = service
        .insert_manual("bob", CandidateMemory::new("I prefer green tea", MemoryCategory::Preference, 0.6))
        .await
        .unwrap();
    assert_ne!(alice.id, bob.id);

    let found = service.retrieve("bob", "green tea", &[], 5).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].owner_id, "bob");
    assert!(service.retrieve("carol", "green tea", &[], 5).await.is_empty());
    assert!(matches!(service.get("bob", &alice.id), Err(MnemosError::NotFound(_))));
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("snapshot.json");

    let service = hash_service();
    service
        .insert_manual("alice", CandidateMemory::new("Always reply in French", MemoryCategory::Instruction, 0.8))
        .await
        .unwrap();
    service
        .insert_manual("bob", CandidateMemory::new("Bob drinks tea every afternoon", MemoryCategory::Preference, 0.5))
        .await
        .unwrap();
    service.save_snapshot_to(&path).await.unwrap();

    let config = MemoryConfig {
        data_path: Some(path),
        ..Default::default()
    };
    let restored = MemoryService::open(config, Arc::new(HashEmbedder::new(256)), Arc::new(KeywordClassifier::new()))
        .await
        .unwrap();
    assert_eq!(restored.stats().store.memories, 2);

    let found = restored.retrieve("alice", "reply in French", &[], 5).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].category, MemoryCategory::Instruction);
}
