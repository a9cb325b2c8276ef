//! Error types for Mnemos.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MnemosError {
    /// Malformed candidate or input. Rejected locally, never enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Classification or completion capability is down.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Embedding capability is down.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Circuit open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Task {task_id} exhausted after {attempts} attempts: {last_error}")]
    TaskExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Task removed from the queue before it ran.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MnemosError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// True for failures of an external capability (completion, embedding,
    /// timeouts) as opposed to bad input or missing records.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::EmbeddingUnavailable(_) | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MnemosError>;
