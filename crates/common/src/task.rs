//! Background processing task types.

use serde::{Deserialize, Serialize};

use crate::message::{new_id, now_millis};

/// Conventional priority levels. Task priorities are plain integers
/// (higher runs sooner); these name the values callers normally use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn value(self) -> i32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 10,
            TaskPriority::High => 20,
            TaskPriority::Critical => 30,
        }
    }
}

impl From<TaskPriority> for i32 {
    fn from(priority: TaskPriority) -> Self {
        priority.value()
    }
}

/// What a task does once a worker picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Run detection on a message and persist the candidates.
    Detect,
    /// Persist a single candidate memory.
    Store,
    /// Discover relationships for a stored memory.
    Relate,
}

/// Current status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// A unit of background work. The payload type is supplied by the crate
/// that executes the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTask<P> {
    /// Unique task ID
    pub id: String,

    pub kind: TaskKind,

    /// Higher runs sooner
    pub priority: i32,

    pub payload: P,

    /// Number of executions started so far
    pub attempts: u32,

    pub status: TaskStatus,

    /// Last failure message, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Creation timestamp (Unix millis)
    pub created_at: u64,

    /// Last update timestamp
    pub updated_at: u64,
}

impl<P> ProcessingTask<P> {
    pub fn new(kind: TaskKind, payload: P) -> Self {
        let now = now_millis();

        Self {
            id: new_id("task"),
            kind,
            priority: TaskPriority::Normal.value(),
            payload,
            attempts: 0,
            status: TaskStatus::Queued,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = now_millis();
    }
}
