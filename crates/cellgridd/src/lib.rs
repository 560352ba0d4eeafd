//! cellgridd — the CellGrid daemon.
//!
//! Assembles every subsystem in one process:
//! - State store (redb)
//! - Auctioneer
//! - One rep per configured cell, each with a local container runtime
//! - Converger
//! - Stager on the in-process message bus
//! - REST API
//!
//! The binary in `main.rs` parses flags and config and serves the API;
//! [`Grid`] owns the wiring so tests can run the same assembly.

pub mod grid;

pub use grid::Grid;
