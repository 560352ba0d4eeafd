//! cellgrid-converger — the convergence loop.
//!
//! Every interval the converger reads desired state, actual state, tasks and
//! cell presences, plans the corrections that bring them back in line and
//! applies them. Starts go to the auctioneer; stops go through the owning
//! cell. Each sweep is idempotent: a sweep run on the state left by another
//! plans nothing new.
//!
//! # Components
//!
//! - **`plan`** — Pure planning from a snapshot
//! - **`converger`** — Snapshot, apply and the periodic loop

pub mod converger;
pub mod error;
pub mod plan;

#[cfg(test)]
mod testing;

pub use converger::{ConvergeSummary, Converger};
pub use error::{ConvergeError, ConvergeResult};
pub use plan::{CELL_DISAPPEARED, ConvergencePlan, Correction, Snapshot, TASK_EXPIRED, plan};
