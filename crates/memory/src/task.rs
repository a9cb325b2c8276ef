//! Payloads carried by background tasks.

use mnemos_common::{ProcessingTask, TaskKind, TaskPriority};
use serde::{Deserialize, Serialize};

use crate::detector::DetectionRequest;
use crate::types::CandidateMemory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run detection on a chat turn and store what it finds.
    Detect(DetectionRequest),
    /// Store one already-detected candidate.
    Store {
        owner_id: String,
        candidate: CandidateMemory,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_message_id: Option<String>,
    },
    /// Link a stored memory to its neighbours.
    Relate { memory_id: String },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Detect(_) => TaskKind::Detect,
            TaskPayload::Store { .. } => TaskKind::Store,
            TaskPayload::Relate { .. } => TaskKind::Relate,
        }
    }

    /// Priority a task of this kind is enqueued at unless overridden.
    pub fn default_priority(&self) -> TaskPriority {
        match self {
            TaskPayload::Detect(_) => TaskPriority::Normal,
            TaskPayload::Store { .. } => TaskPriority::High,
            TaskPayload::Relate { .. } => TaskPriority::Low,
        }
    }

    /// Two payloads with equal keys do the same work.
    pub fn dedupe_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self {
            TaskPayload::Detect(request) => Some(&request.owner_id),
            TaskPayload::Store { owner_id, .. } => Some(owner_id),
            TaskPayload::Relate { .. } => None,
        }
    }

    /// Wraps the payload in a task at its default priority.
    pub fn into_task(self) -> MemoryTask {
        let priority = self.default_priority();
        ProcessingTask::new(self.kind(), self).with_priority(priority)
    }
}

pub type MemoryTask = ProcessingTask<TaskPayload>;
