//! Pure convergence planning.
//!
//! `plan` compares one snapshot of desired and actual state at a point in
//! time and lists the corrections to make. It does no I/O, so every rule
//! is testable without a store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use cellgrid_core::ConvergerConfig;
use cellgrid_placement::PlacementError;
use cellgrid_state::{
    ActualLrp, ActualLrpKey, ActualLrpState, CellPresence, CrashPolicy, DesiredLrp,
    RestartDecision, Task, TaskState,
};

pub const CELL_DISAPPEARED: &str = "cell disappeared";
pub const TASK_EXPIRED: &str = "not started within time limit";

/// Everything one sweep looks at, read at `now` (epoch millis).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub desired: Vec<DesiredLrp>,
    pub actuals: Vec<ActualLrp>,
    pub tasks: Vec<Task>,
    /// All presence records, live or expired.
    pub cells: Vec<CellPresence>,
    pub now: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    /// A desired index has no row at all.
    CreateInstance { key: ActualLrpKey, domain: String },
    /// An Unclaimed row worth another auction.
    StartInstance { key: ActualLrpKey, expected_index: u64 },
    /// A Crashed row whose backoff has elapsed.
    RestartInstance { key: ActualLrpKey, expected_index: u64 },
    /// An owned row on a cell whose lease lapsed past the grace window.
    ReclaimInstance { key: ActualLrpKey, expected_index: u64 },
    /// A row above the desired count or with no desired LRP.
    RetireInstance { actual: ActualLrp },
    StartTask { task_guid: String },
    FailTask { task_guid: String, reason: String },
    /// A finished task nobody resolved in time.
    DeleteTask { task_guid: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergencePlan {
    pub corrections: Vec<Correction>,
}

impl ConvergencePlan {
    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.corrections.len()
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn older_than(since: u64, now: u64, window: Duration) -> bool {
    now.saturating_sub(since) >= millis(window)
}

pub fn plan(snapshot: &Snapshot, policy: &CrashPolicy, config: &ConvergerConfig) -> ConvergencePlan {
    let now = snapshot.now;
    let grace = millis(config.cell_grace);
    let live_cells: HashSet<&str> = snapshot
        .cells
        .iter()
        .filter(|c| c.expires_at.saturating_add(grace) > now)
        .map(|c| c.cell_id.as_str())
        .collect();
    let desired: HashMap<&str, &DesiredLrp> = snapshot
        .desired
        .iter()
        .map(|d| (d.process_guid.as_str(), d))
        .collect();
    let mut corrections = Vec::new();

    // Missing indices.
    let existing: HashSet<(&str, u32)> = snapshot
        .actuals
        .iter()
        .map(|a| (a.process_guid.as_str(), a.index))
        .collect();
    let mut by_guid: BTreeMap<&str, &DesiredLrp> = BTreeMap::new();
    by_guid.extend(desired.iter().map(|(guid, d)| (*guid, *d)));
    for (guid, d) in by_guid {
        for index in 0..d.instances {
            if !existing.contains(&(guid, index)) {
                corrections.push(Correction::CreateInstance {
                    key: ActualLrpKey::new(guid, index),
                    domain: d.domain.clone(),
                });
            }
        }
    }

    let cell_mismatch = PlacementError::CellMismatch.to_string();

    for actual in &snapshot.actuals {
        let key = actual.key();
        let wanted = desired
            .get(actual.process_guid.as_str())
            .is_some_and(|d| actual.index < d.instances);
        if !wanted {
            corrections.push(Correction::RetireInstance {
                actual: actual.clone(),
            });
            continue;
        }

        match actual.state {
            ActualLrpState::Claimed | ActualLrpState::Running => {
                if !live_cells.contains(actual.cell_id.as_str()) {
                    corrections.push(Correction::ReclaimInstance {
                        key,
                        expected_index: actual.modification_index,
                    });
                }
            }
            ActualLrpState::Crashed => {
                let elapsed = Duration::from_millis(now.saturating_sub(actual.since));
                if policy.decide(actual.crash_count, elapsed) == RestartDecision::RestartNow {
                    corrections.push(Correction::RestartInstance {
                        key,
                        expected_index: actual.modification_index,
                    });
                }
            }
            ActualLrpState::Unclaimed => {
                // `since` is the last placement request; see `requeue_actual_lrp`.
                let retry = actual.placement_error.as_deref() != Some(cell_mismatch.as_str())
                    && older_than(actual.since, now, config.retry_unplaced_after);
                if retry {
                    corrections.push(Correction::StartInstance {
                        key,
                        expected_index: actual.modification_index,
                    });
                }
            }
        }
    }

    for task in &snapshot.tasks {
        let task_guid = task.task_guid.clone();
        match task.state {
            TaskState::Pending => {
                if older_than(task.created_at, now, config.expire_pending_task_after) {
                    corrections.push(Correction::FailTask {
                        task_guid,
                        reason: TASK_EXPIRED.to_string(),
                    });
                } else if older_than(task.updated_at, now, config.retry_unplaced_after) {
                    corrections.push(Correction::StartTask { task_guid });
                }
            }
            TaskState::Running => {
                if !live_cells.contains(task.cell_id.as_str()) {
                    corrections.push(Correction::FailTask {
                        task_guid,
                        reason: CELL_DISAPPEARED.to_string(),
                    });
                }
            }
            TaskState::Completed => {
                let completed_at = task.first_completed_at.unwrap_or(task.updated_at);
                if older_than(completed_at, now, config.expire_completed_task_after) {
                    corrections.push(Correction::DeleteTask { task_guid });
                }
            }
            TaskState::Resolving => {
                if older_than(task.updated_at, now, config.expire_completed_task_after) {
                    corrections.push(Correction::DeleteTask { task_guid });
                }
            }
        }
    }

    ConvergencePlan { corrections }
}
