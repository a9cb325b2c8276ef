//! Common types shared across Mnemos crates.
//!
//! This crate provides the error taxonomy, conversation turn types and the
//! generic background task envelope that the memory and API crates build on.

pub mod error;
pub mod message;
pub mod task;

pub use error::{MnemosError, Result};
pub use message::{new_id, now_millis, ConversationTurn, MessageRole};
pub use task::{ProcessingTask, TaskKind, TaskPriority, TaskStatus};
