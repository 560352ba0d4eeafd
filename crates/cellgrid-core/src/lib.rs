//! cellgrid-core — configuration and small shared helpers.
//!
//! The daemon reads a single `cellgrid.toml` ([`GridConfig`]); the other
//! crates receive the typed sections they need and never touch the file.

pub mod config;
pub mod duration;

pub use config::{
    ApiConfig, AuctioneerConfig, CellConfig, ConvergerConfig, CrashPolicyConfig, GridConfig,
    StagerConfig, StoreConfig,
};
pub use duration::{DurationError, format_duration, parse_duration};
