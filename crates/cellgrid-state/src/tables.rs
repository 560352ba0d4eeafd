//! redb table definitions for the CellGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Actual LRPs use the composite key `{process_guid}:{index}` so a prefix
//! scan yields every instance of one process.

use redb::TableDefinition;

/// Desired LRPs keyed by `{process_guid}`.
pub const DESIRED_LRPS: TableDefinition<&str, &[u8]> = TableDefinition::new("desired_lrps");

/// Actual LRP instances keyed by `{process_guid}:{index}`.
pub const ACTUAL_LRPS: TableDefinition<&str, &[u8]> = TableDefinition::new("actual_lrps");

/// Tasks keyed by `{task_guid}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Cell presences keyed by `{cell_id}`.
pub const CELLS: TableDefinition<&str, &[u8]> = TableDefinition::new("cells");
