//! Memory records and the values exchanged between the pipeline stages.

use std::fmt;
use std::str::FromStr;

use mnemos_common::{new_id, now_millis, MnemosError, Result};
use serde::{Deserialize, Serialize};

/// Shortest detected or manually submitted memory, in chars.
pub const MIN_CANDIDATE_CHARS: usize = 10;
/// Longest detected or manually submitted memory, in chars.
pub const MAX_CANDIDATE_CHARS: usize = 500;
/// Longest stored memory content (merges may grow past a single candidate).
pub const MAX_CONTENT_CHARS: usize = 2000;
pub const MAX_KEYWORDS: usize = 10;

/// What kind of thing a memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Likes, dislikes and habits
    Preference,
    /// Stable facts about the user
    PersonalInfo,
    /// What the user is currently doing or planning
    Context,
    /// Standing directions for how the assistant should behave
    Instruction,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 4] = [
        MemoryCategory::Preference,
        MemoryCategory::PersonalInfo,
        MemoryCategory::Context,
        MemoryCategory::Instruction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Preference => "preference",
            MemoryCategory::PersonalInfo => "personal_info",
            MemoryCategory::Context => "context",
            MemoryCategory::Instruction => "instruction",
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryCategory {
    type Err = MnemosError;

    /// Accepts the canonical names plus the spellings classifiers tend to
    /// produce ("Personal Info", "personal-info").
    fn from_str(s: &str) -> Result<Self> {
        let canonical = s.trim().to_lowercase().replace([' ', '-'], "_");
        match canonical.as_str() {
            "preference" | "preferences" => Ok(MemoryCategory::Preference),
            "personal_info" | "personal" => Ok(MemoryCategory::PersonalInfo),
            "context" => Ok(MemoryCategory::Context),
            "instruction" | "instructions" => Ok(MemoryCategory::Instruction),
            _ => Err(MnemosError::validation(format!("unknown category '{s}'"))),
        }
    }
}

/// A persisted unit of remembered information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Unique ID
    pub id: String,

    /// Tenant that owns this memory
    pub owner_id: String,

    pub content: String,

    pub category: MemoryCategory,

    /// Importance score (0.0 - 1.0)
    pub importance: f32,

    /// Vector embedding, same length for every memory in a store
    pub embedding: Vec<f32>,

    /// Ordered, lower-cased, at most [`MAX_KEYWORDS`]
    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_conversation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,

    /// Creation timestamp (Unix millis)
    pub created_at: u64,

    /// Last mutation timestamp
    pub updated_at: u64,
}

impl Memory {
    pub fn new(
        owner_id: impl Into<String>,
        content: impl Into<String>,
        category: MemoryCategory,
        importance: f32,
        embedding: Vec<f32>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: new_id("mem"),
            owner_id: owner_id.into(),
            content: content.into(),
            category,
            importance,
            embedding,
            keywords: Vec::new(),
            source_conversation_id: None,
            source_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_source(
        mut self,
        conversation_id: Option<String>,
        message_id: Option<String>,
    ) -> Self {
        self.source_conversation_id = conversation_id;
        self.source_message_id = message_id;
        self
    }

    /// Checks the record-level invariants enforced on every write.
    pub fn validate(&self) -> Result<()> {
        validate_content(&self.content, 1, MAX_CONTENT_CHARS)?;
        validate_importance(self.importance)?;
        if self.owner_id.trim().is_empty() {
            return Err(MnemosError::validation("owner_id must not be empty"));
        }
        if self.embedding.is_empty() {
            return Err(MnemosError::validation("embedding must not be empty"));
        }
        Ok(())
    }
}

pub(crate) fn validate_content(content: &str, min: usize, max: usize) -> Result<()> {
    let len = content.trim().chars().count();
    if len < min || len > max {
        return Err(MnemosError::validation(format!(
            "content must be {min}-{max} characters, got {len}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_importance(importance: f32) -> Result<()> {
    if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
        return Err(MnemosError::validation(format!(
            "importance must be within [0, 1], got {importance}"
        )));
    }
    Ok(())
}

/// A single self-contained statement owned by a [`Memory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicFact {
    pub id: String,
    pub memory_id: String,
    pub statement: String,
    pub confidence: f32,
}

impl AtomicFact {
    pub fn new(memory_id: impl Into<String>, statement: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: new_id("fact"),
            memory_id: memory_id.into(),
            statement: statement.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    RelatesTo,
    Contradicts,
    Supersedes,
    Elaborates,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::RelatesTo => "relates_to",
            RelationType::Contradicts => "contradicts",
            RelationType::Supersedes => "supersedes",
            RelationType::Elaborates => "elaborates",
        }
    }
}

/// Directed edge between two memories of the same owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_memory_id: String,
    pub to_memory_id: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub strength: f32,
    pub created_at: u64,
}

impl Relationship {
    pub fn new(
        from_memory_id: impl Into<String>,
        to_memory_id: impl Into<String>,
        relation_type: RelationType,
        strength: f32,
    ) -> Self {
        Self {
            id: new_id("rel"),
            from_memory_id: from_memory_id.into(),
            to_memory_id: to_memory_id.into(),
            relation_type,
            strength: strength.clamp(0.0, 1.0),
            created_at: now_millis(),
        }
    }

    pub fn touches(&self, memory_id: &str) -> bool {
        self.from_memory_id == memory_id || self.to_memory_id == memory_id
    }
}

/// Detector output, not yet embedded or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMemory {
    pub content: String,
    pub category: MemoryCategory,
    pub importance: f32,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl CandidateMemory {
    pub fn new(content: impl Into<String>, category: MemoryCategory, importance: f32) -> Self {
        Self {
            content: content.into(),
            category,
            importance,
            keywords: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_content(&self.content, MIN_CANDIDATE_CHARS, MAX_CANDIDATE_CHARS)?;
        validate_importance(self.importance)
    }
}

/// A candidate bound to its owner and embedding, ready for deduplication.
#[derive(Debug, Clone)]
pub struct PendingMemory {
    pub owner_id: String,
    pub candidate: CandidateMemory,
    pub embedding: Vec<f32>,
    pub source_conversation_id: Option<String>,
    pub source_message_id: Option<String>,
}

impl PendingMemory {
    pub fn new(owner_id: impl Into<String>, candidate: CandidateMemory, embedding: Vec<f32>) -> Self {
        Self {
            owner_id: owner_id.into(),
            candidate,
            embedding,
            source_conversation_id: None,
            source_message_id: None,
        }
    }

    pub fn with_source(
        mut self,
        conversation_id: Option<String>,
        message_id: Option<String>,
    ) -> Self {
        self.source_conversation_id = conversation_id;
        self.source_message_id = message_id;
        self
    }
}

/// Partial update applied by [`crate::store::EmbeddingStore::update`].
#[derive(Debug, Clone, Default)]
pub struct MemoryMutation {
    pub content: Option<String>,
    pub category: Option<MemoryCategory>,
    pub importance: Option<f32>,
    pub keywords: Option<Vec<String>>,
    pub embedding: Option<Vec<f32>>,
}

/// Recorded when a new memory lands close to, but not on top of, an
/// existing one. Consumed by relationship discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionFlag {
    pub memory_id: String,
    pub other_id: String,
    pub similarity: f32,
}
