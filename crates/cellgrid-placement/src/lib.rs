//! CellGrid placement — auction-based assignment of work to cells.
//!
//! This crate decides *where* LRP instances and tasks run. It does not run
//! anything itself; winning cells claim their work through the state store.
//!
//! # Components
//!
//! - **`scorer`** — Cell capability gating and load scoring
//! - **`auction`** — The pure batch auction
//! - **`convert`** — Store records to placement requests
//! - **`cell_client`** — The seam to cells, plus the directory of live clients
//! - **`auctioneer`** — Batching runner that fetches cell state and dispatches work

pub mod auction;
pub mod auctioneer;
pub mod cell_client;
pub mod convert;
pub mod error;
pub mod scorer;

pub use auction::{
    Assignment, AuctionFailure, AuctionRequest, AuctionResults, LrpStartRequest, TaskStartRequest,
    Work, run_auction,
};
pub use auctioneer::{Auctioneer, AuctioneerHandle, BatchSummary, StartRequest};
pub use cell_client::{CellClient, CellDirectory, retire_actual_lrp};
pub use convert::{lrp_start_request, requirements_for, task_start_request};
pub use error::{CellClientError, PlacementError};
pub use scorer::{Capability, CellState, PlacementRequirements, ScoringWeights};
