//! Converger error types.

use thiserror::Error;

use cellgrid_placement::CellClientError;
use cellgrid_state::StateError;

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("cell error: {0}")]
    Cell(#[from] CellClientError),
}

impl ConvergeError {
    /// The record moved on since the snapshot; the next sweep re-plans it.
    pub fn is_stale(&self) -> bool {
        match self {
            ConvergeError::State(e) | ConvergeError::Cell(CellClientError::State(e)) => {
                matches!(
                    e,
                    StateError::Conflict(_)
                        | StateError::NotFound(_)
                        | StateError::AlreadyExists(_)
                        | StateError::InvalidTransition { .. }
                )
            }
            ConvergeError::Cell(_) => false,
        }
    }
}

pub type ConvergeResult<T> = Result<T, ConvergeError>;
