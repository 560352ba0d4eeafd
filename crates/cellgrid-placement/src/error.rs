//! Error types for placement.

use thiserror::Error;

/// Why the auction could not place a request.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// No cell offers every capability the request needs.
    #[error("found no compatible cell")]
    CellMismatch,

    /// Compatible cells exist but none has room.
    #[error("insufficient resources")]
    InsufficientResources,
}

impl PlacementError {
    /// Whether a later auction may succeed without the request changing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlacementError::InsufficientResources)
    }
}

/// Failures talking to a cell.
#[derive(Debug, Error)]
pub enum CellClientError {
    #[error("cell {0} is unreachable")]
    Unreachable(String),

    #[error("cell {cell_id} did not answer within {timeout_ms}ms")]
    Timeout { cell_id: String, timeout_ms: u64 },

    #[error("cell {cell_id} refused: {reason}")]
    Refused { cell_id: String, reason: String },

    #[error("state error: {0}")]
    State(#[from] cellgrid_state::StateError),
}
