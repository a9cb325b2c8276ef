//! Memory intelligence for Mnemos.
//!
//! Watches conversation turns, extracts durable facts about the user, stores
//! them without duplicates and hands the relevant ones back when a prompt is
//! being assembled.
//!
//! # Categories
//!
//! - **Preference**: likes, dislikes, habits
//! - **Personal info**: names, places, relationships
//! - **Context**: current projects and plans
//! - **Instruction**: standing requests about how to respond
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MemoryService                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  observe_turn ──▶ BackgroundProcessor (priority queue)       │
//! │                        │   guarded by CircuitBreaker         │
//! │                        ▼                                     │
//! │                   MemoryPipeline                             │
//! │                        │                                     │
//! │      Detector ──▶ DeduplicationEngine ──▶ EmbeddingStore     │
//! │                        │                       ▲             │
//! │                        ▼                       │             │
//! │               RelationshipEngine ──────────────┤             │
//! │                                                │             │
//! │  retrieve / build_context ──▶ RetrievalEngine ─┘             │
//! │                                                              │
//! │  PerformanceMonitor records latency and failures throughout  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod detector;
pub mod embedding;
pub mod facts;
pub mod monitor;
pub mod pipeline;
pub mod processor;
pub mod relationship;
pub mod retrieval;
pub mod service;
pub mod store;
pub mod task;
pub mod text;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::MemoryConfig;
pub use dedup::{DedupOutcome, DeduplicationEngine};
pub use detector::{Classifier, DetectionRequest, Detector, KeywordClassifier, LlmClassifier};
pub use embedding::{build_embedder, EmbeddingConfig, EmbeddingProvider, HashEmbedder};
pub use monitor::PerformanceMonitor;
pub use processor::{BackgroundProcessor, TaskHandle, TaskOutcome};
pub use retrieval::{RetrievalEngine, RetrievedMemory};
pub use service::{MemoryService, ServiceStats};
pub use store::EmbeddingStore;
pub use task::{MemoryTask, TaskPayload};
pub use types::{CandidateMemory, Memory, MemoryCategory, RelationType, Relationship};
