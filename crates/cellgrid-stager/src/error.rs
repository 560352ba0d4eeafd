//! Stager error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagerError {
    #[error("no compiler defined for requested stack")]
    UnknownStack(String),

    #[error("invalid staging JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed staging result: {0}")]
    Result(String),

    #[error("state error: {0}")]
    State(#[from] cellgrid_state::StateError),
}

pub type StagerResult<T> = Result<T, StagerError>;
