//! Error types for sigil-agent

use thiserror::Error;

/// Result type alias using sigil-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Ai(#[from] sigil_ai::Error),

    /// Conversation persistence failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Conversation serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The event sink was rejected or lost
    #[error("Event sink error: {0}")]
    EventSink(String),

    /// A configured bound was exceeded
    #[error("{0}")]
    BoundExceeded(String),

    /// Sub-agent management failed
    #[error("Sub-agent error: {0}")]
    SubAgent(String),

    /// The operation was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}
