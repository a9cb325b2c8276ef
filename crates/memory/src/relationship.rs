//! Relationship discovery between an owner's memories.

use std::collections::HashSet;
use std::sync::Arc;

use mnemos_common::{MnemosError, Result};
use tracing::{debug, info};

use crate::config::RelationshipConfig;
use crate::store::EmbeddingStore;
use crate::text::content_terms;
use crate::types::{Memory, RelationType, Relationship};

pub struct RelationshipEngine {
    store: Arc<EmbeddingStore>,
    config: RelationshipConfig,
}

impl RelationshipEngine {
    pub fn new(store: Arc<EmbeddingStore>, config: RelationshipConfig) -> Self {
        Self { store, config }
    }

    /// Links `memory_id` to its closest neighbours. Pairs flagged during
    /// deduplication become `contradicts` edges; others above the relation
    /// threshold become `elaborates` or `relates_to`. A memory deleted
    /// before discovery runs yields no edges.
    pub fn discover_relationships(&self, memory_id: &str) -> Result<Vec<Relationship>> {
        let memory = match self.store.get(memory_id) {
            Ok(memory) => memory,
            Err(MnemosError::NotFound(_)) => {
                debug!(memory_id = %memory_id, "Memory gone before relationship discovery");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut created = Vec::new();
        let mut linked: HashSet<String> = HashSet::new();
        linked.insert(memory.id.clone());

        for flag in self.store.flags_for(&memory.id) {
            if created.len() == self.config.max_edges {
                break;
            }
            if !linked.insert(flag.other_id.clone()) || !self.store.contains(&flag.other_id) {
                continue;
            }
            let edge = Relationship::new(&flag.memory_id, &flag.other_id, RelationType::Contradicts, flag.similarity);
            created.push(self.store.add_relationship(edge)?);
        }

        let remaining = self.config.max_edges.saturating_sub(created.len());
        if remaining > 0 {
            // extra headroom for the memory itself and already-linked ids
            let neighbours = self.store.similarity_search(
                &memory.owner_id,
                &memory.embedding,
                remaining + linked.len(),
                self.config.relation_threshold,
            )?;
            for neighbour in neighbours {
                if created.len() == self.config.max_edges {
                    break;
                }
                if !linked.insert(neighbour.memory.id.clone()) {
                    continue;
                }
                let relation_type = classify_pair(&memory, &neighbour.memory);
                let edge = Relationship::new(&memory.id, &neighbour.memory.id, relation_type, neighbour.score);
                created.push(self.store.add_relationship(edge)?);
            }
        }

        self.store.clear_flags(&memory.id);
        info!(memory_id = %memory.id, edges = created.len(), "Relationships discovered");
        Ok(created)
    }

    /// Stored edges touching `memory_id`.
    pub fn relationships_for(&self, memory_id: &str) -> Result<Vec<Relationship>> {
        self.store.relationships_for(memory_id)
    }
}

/// `elaborates` when `from` states everything `to` does and more.
fn classify_pair(from: &Memory, to: &Memory) -> RelationType {
    let from_terms = content_terms(&from.content);
    let to_terms = content_terms(&to.content);
    if !to_terms.is_empty() && to_terms.len() < from_terms.len() && to_terms.is_subset(&from_terms) {
        RelationType::Elaborates
    } else {
        RelationType::RelatesTo
    }
}
