//! Pub/sub error types

use thiserror::Error;

/// Error type for topic operations
#[derive(Debug, Clone, Error)]
pub enum TopicError {
    /// A topic with this room ID is already registered
    #[error("room topic already exists: {0}")]
    AlreadyExists(String),
}
