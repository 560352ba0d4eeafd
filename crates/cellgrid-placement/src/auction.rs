//! The batch auction.
//!
//! Given a batch of start requests and a snapshot of every reachable cell,
//! assign each request to the compatible cell with the lowest load after
//! placement. Capacity consumed by earlier assignments in the same batch is
//! taken into account. Pure and deterministic: the same inputs always give
//! the same assignments.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cellgrid_state::ActualLrpKey;

use crate::error::PlacementError;
use crate::scorer::{CellState, PlacementRequirements, ScoringWeights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrpStartRequest {
    pub key: ActualLrpKey,
    pub domain: String,
    pub requirements: PlacementRequirements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStartRequest {
    pub task_guid: String,
    pub domain: String,
    pub requirements: PlacementRequirements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuctionRequest {
    Lrp(LrpStartRequest),
    Task(TaskStartRequest),
}

impl AuctionRequest {
    pub fn requirements(&self) -> &PlacementRequirements {
        match self {
            AuctionRequest::Lrp(r) => &r.requirements,
            AuctionRequest::Task(r) => &r.requirements,
        }
    }

    fn process_guid(&self) -> Option<&str> {
        match self {
            AuctionRequest::Lrp(r) => Some(r.key.process_guid.as_str()),
            AuctionRequest::Task(_) => None,
        }
    }

    /// LRPs first, lower indices first, bigger requests first, then by guid.
    fn placement_order(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AuctionRequest::Lrp(a), AuctionRequest::Lrp(b)) => a
                .key
                .index
                .cmp(&b.key.index)
                .then(b.requirements.memory_mb.cmp(&a.requirements.memory_mb))
                .then(a.key.process_guid.cmp(&b.key.process_guid)),
            (AuctionRequest::Task(a), AuctionRequest::Task(b)) => b
                .requirements
                .memory_mb
                .cmp(&a.requirements.memory_mb)
                .then(a.task_guid.cmp(&b.task_guid)),
            (AuctionRequest::Lrp(_), AuctionRequest::Task(_)) => Ordering::Less,
            (AuctionRequest::Task(_), AuctionRequest::Lrp(_)) => Ordering::Greater,
        }
    }
}

/// Work handed to one cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub lrps: Vec<LrpStartRequest>,
    pub tasks: Vec<TaskStartRequest>,
}

impl Work {
    pub fn is_empty(&self) -> bool {
        self.lrps.is_empty() && self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lrps.len() + self.tasks.len()
    }

    pub fn push(&mut self, request: AuctionRequest) {
        match request {
            AuctionRequest::Lrp(r) => self.lrps.push(r),
            AuctionRequest::Task(r) => self.tasks.push(r),
        }
    }

    pub fn into_requests(self) -> impl Iterator<Item = AuctionRequest> {
        self.lrps
            .into_iter()
            .map(AuctionRequest::Lrp)
            .chain(self.tasks.into_iter().map(AuctionRequest::Task))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub cell_id: String,
    pub request: AuctionRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuctionFailure {
    pub request: AuctionRequest,
    pub error: PlacementError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuctionResults {
    pub assignments: Vec<Assignment>,
    pub failures: Vec<AuctionFailure>,
}

impl AuctionResults {
    /// Group assignments into one `Work` per cell, ordered by cell ID.
    pub fn work_by_cell(&self) -> Vec<(String, Work)> {
        let mut grouped: std::collections::BTreeMap<String, Work> = Default::default();
        for assignment in &self.assignments {
            grouped
                .entry(assignment.cell_id.clone())
                .or_default()
                .push(assignment.request.clone());
        }
        grouped.into_iter().collect()
    }
}

/// Place `requests` onto `cells`.
pub fn run_auction(
    mut requests: Vec<AuctionRequest>,
    cells: &[CellState],
    weights: &ScoringWeights,
) -> AuctionResults {
    requests.sort_by(|a, b| a.placement_order(b));

    let mut cells: Vec<CellState> = cells.to_vec();
    cells.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));

    let mut results = AuctionResults::default();
    for request in requests {
        let req = request.requirements();
        let guid = request.process_guid();

        let mut any_compatible = false;
        let mut best: Option<(usize, f64)> = None;
        for (i, cell) in cells.iter().enumerate() {
            if !cell.is_compatible(req) {
                continue;
            }
            any_compatible = true;
            if !cell.has_room(req) {
                continue;
            }
            let load = cell.load_after(req, guid, weights);
            // Cells are sorted, so a strict comparison keeps the lower ID on ties.
            if best.is_none_or(|(_, best_load)| load < best_load) {
                best = Some((i, load));
            }
        }

        match best {
            Some((i, load)) => {
                let cell = &mut cells[i];
                cell.reserve(req, guid);
                debug!(cell_id = %cell.cell_id, load, "auction winner");
                results.assignments.push(Assignment {
                    cell_id: cell.cell_id.clone(),
                    request,
                });
            }
            None => {
                // An empty cell set is a capacity problem, not a mismatch.
                let error = if any_compatible || cells.is_empty() {
                    PlacementError::InsufficientResources
                } else {
                    PlacementError::CellMismatch
                };
                results.failures.push(AuctionFailure { request, error });
            }
        }
    }
    results
}
