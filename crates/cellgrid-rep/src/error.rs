//! Cell agent error types.
//!
//! The `Display` of the execution variants is what lands in a task's
//! `failure_reason` or an instance's `crash_reason`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepError {
    #[error("Exited with status {status}")]
    Exited { status: i32 },

    #[error("Exited with status {status} (out of memory)")]
    OutOfMemory { status: i32 },

    /// Carries the rendered limit, e.g. `500ms`.
    #[error("exceeded {0} timeout")]
    TimedOut(String),

    /// An `EmitProgress` failure, already prefixed.
    #[error("{0}")]
    Step(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("unknown container: {0}")]
    UnknownContainer(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("state store error: {0}")]
    State(#[from] cellgrid_state::StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepError {
    pub fn exit(status: i32, oom_killed: bool) -> Self {
        if oom_killed {
            RepError::OutOfMemory { status }
        } else {
            RepError::Exited { status }
        }
    }
}

pub type RepResult<T> = Result<T, RepError>;
