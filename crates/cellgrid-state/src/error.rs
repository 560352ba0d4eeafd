//! Error types for the CellGrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The record changed underneath the caller. Re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }
}
