//! cellgrid-state — desired and actual state for CellGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds desired LRPs, actual LRP
//! instances, tasks and cell presences, and exposes the lifecycle
//! transitions every other component drives.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns and
//! carry a `modification_index`. Every lifecycle operation runs inside a
//! single write transaction that re-reads the record, checks the
//! transition, and writes it back with the index bumped. redb serializes
//! write transactions, so a caller that loses a race sees
//! [`StateError::Conflict`] rather than a lost update.
//!
//! Committed changes are broadcast as [`StoreEvent`]s for watchers.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod cells;
pub mod crash_policy;
pub mod egress;
pub mod error;
pub mod events;
pub mod lrps;
pub mod routes;
pub mod store;
pub mod tables;
pub mod tasks;
pub mod types;

pub use crash_policy::{CrashPolicy, RestartDecision};
pub use egress::egress_allowed;
pub use error::{StateError, StateResult};
pub use events::StoreEvent;
pub use lrps::{CrashOutcome, DesiredLrpUpdateOutcome};
pub use routes::{RoutingTable, routing_table};
pub use store::StateStore;
pub use types::*;
