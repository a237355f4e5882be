//! Error types for Recall

use thiserror::Error;

/// Result type alias for Recall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Recall
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The profile preamble alone does not fit the prompt budget
    #[error("preamble needs {preamble_tokens} tokens but the prompt budget is {budget}")]
    BudgetExceeded { preamble_tokens: usize, budget: usize },

    /// Durable history could not be read or written
    #[error("storage error: {0}")]
    Storage(String),

    /// The inference call failed or its stream ended abnormally
    #[error("inference error: {0}")]
    Inference(String),

    /// The caller abandoned the request before the reply completed
    #[error("request cancelled")]
    Cancelled,

    /// Conversation id cannot be used as a storage key
    #[error("invalid conversation id: {0:?}")]
    InvalidConversationId(String),

    /// Profile file could not be loaded
    #[error("profile error: {0}")]
    Profile(String),

    /// Empty user message
    #[error("message is empty")]
    EmptyMessage,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is an operator-level misconfiguration that retrying will not fix
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::BudgetExceeded { .. })
    }
}
