//! Change notifications published after each committed write.

use serde::Serialize;

use crate::types::{ActualLrpKey, ActualLrpState, TaskState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    DesiredLrpChanged { process_guid: String },
    DesiredLrpRemoved { process_guid: String },
    ActualLrpChanged { key: ActualLrpKey, state: ActualLrpState },
    ActualLrpRemoved { key: ActualLrpKey },
    TaskChanged { task_guid: String, state: TaskState },
    /// A task reached Completed. Stagers and other owners resolve on this.
    TaskCompleted {
        task_guid: String,
        domain: String,
        failed: bool,
    },
    TaskRemoved { task_guid: String },
    CellChanged { cell_id: String },
    CellRemoved { cell_id: String },
}
