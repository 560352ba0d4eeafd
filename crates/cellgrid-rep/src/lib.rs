//! cellgrid-rep — the cell agent.
//!
//! A rep owns one cell's capacity. It bids in auctions through the
//! [`CellClient`](cellgrid_placement::CellClient) seam, claims the work it
//! wins in the store, and supervises one container per LRP instance or task
//! until that work crashes, completes or is stopped.
//!
//! # Components
//!
//! - **`ledger`** — Atomic capacity reservations per container handle
//! - **`runtime`** — The container runtime seam
//! - **`local_runtime`** — Directory-per-container runtime on the host
//! - **`egress`** — Per-container proxy that enforces egress rules
//! - **`transfer`** — Artifact download and upload, plus the download cache
//! - **`steps`** — Action tree execution inside a container
//! - **`monitor`** — Probe status tracking for monitored instances
//! - **`supervisor`** — One supervisor task per container
//! - **`rep`** — Auction answers, heartbeats, reconcile and evacuation

pub mod egress;
pub mod error;
pub mod ledger;
pub mod local_runtime;
pub mod monitor;
pub mod rep;
pub mod runtime;
pub mod steps;
mod supervisor;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use error::{RepError, RepResult};
pub use ledger::{CapacityLedger, LedgerSnapshot, ReserveOutcome};
pub use local_runtime::LocalRuntime;
pub use rep::{ReconcileSummary, Rep};
pub use runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ProcessExit, ProcessSpec};
pub use steps::StepRunner;
pub use transfer::{DownloadCache, HttpTransfer, Transfer};
