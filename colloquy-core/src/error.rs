//! Error types for Colloquy operations

use crate::timeline::{CandidateId, ItemId};

/// Result type for Colloquy operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error types for the conversation engine
///
/// Only data-shaped failures live here. Out-of-range indices are caller
/// contract violations and panic instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Context resolution was anchored on something other than a request
    #[error("Invalid anchor at index {index}: expected a request, found {found}")]
    InvalidAnchor { index: usize, found: &'static str },

    /// Malformed clipboard payload
    #[error("Payload error: {0}")]
    Payload(String),

    /// A chain step was interrupted on every attempt
    #[error("Chain step {step} failed after {attempts} attempts")]
    RetryExhausted { step: usize, attempts: u32 },

    /// A chain run was cancelled before the given step started
    #[error("Chain cancelled before step {step}")]
    ChainCancelled { step: usize },

    /// Timeline item not present in the session
    #[error("Timeline item not found: {0}")]
    ItemNotFound(ItemId),

    /// Candidate not present in its response group
    #[error("Response candidate not found: {0}")]
    CandidateNotFound(CandidateId),

    /// Chat client failure (captured into candidates, surfaced by registries)
    #[error("Client error: {0}")]
    Client(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Creates a payload error
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload(message.into())
    }

    /// Check if this is a payload error
    pub fn is_payload(&self) -> bool {
        matches!(self, Self::Payload(_))
    }

    /// Check if this is an invalid anchor error
    pub fn is_invalid_anchor(&self) -> bool {
        matches!(self, Self::InvalidAnchor { .. })
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}
