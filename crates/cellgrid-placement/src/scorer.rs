//! Cell scoring for placement decisions.
//!
//! A cell is a candidate only when it offers every capability a request
//! needs and still has room for it. Among candidates the auction prefers the
//! lowest load after placement, where load is:
//!
//! - the mean of memory, disk and container utilization,
//! - plus `starting_container_weight × starting / container capacity`,
//! - plus, for LRPs, `process_spread_weight ×` instances of the same process
//!   already on the cell.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cellgrid_state::CellCapacity;

/// A hard requirement a cell must meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Capability {
    /// Preloaded rootfs stack, from `preloaded:<stack>`.
    Stack(String),
    /// Rootfs provider scheme, from `<scheme>://...`.
    Provider(String),
    /// Every listed volume driver must be installed.
    VolumeDrivers(Vec<String>),
    Privileged,
}

/// What one placement request needs from a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequirements {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub capabilities: Vec<Capability>,
}

/// A cell's advertised capabilities and current free capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub cell_id: String,
    #[serde(default)]
    pub zone: String,
    pub total: CellCapacity,
    pub available: CellCapacity,
    pub stacks: Vec<String>,
    pub providers: Vec<String>,
    pub volume_drivers: Vec<String>,
    pub allows_privileged: bool,
    /// Containers reserved but not yet running.
    pub starting_containers: u32,
    /// Instances per process guid already on the cell.
    #[serde(default)]
    pub lrp_instances: BTreeMap<String, u32>,
    /// An evacuating cell accepts nothing.
    #[serde(default)]
    pub evacuating: bool,
}

/// Weights for the load components.
#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub starting_container_weight: f64,
    pub process_spread_weight: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            starting_container_weight: 0.33,
            process_spread_weight: 1.0,
        }
    }
}

impl CellState {
    pub fn offers(&self, capability: &Capability) -> bool {
        match capability {
            Capability::Stack(stack) => self.stacks.iter().any(|s| s == stack),
            Capability::Provider(scheme) => self.providers.iter().any(|p| p == scheme),
            Capability::VolumeDrivers(drivers) => drivers
                .iter()
                .all(|d| self.volume_drivers.iter().any(|v| v == d)),
            Capability::Privileged => self.allows_privileged,
        }
    }

    /// Every capability is offered. Capacity is not considered.
    pub fn is_compatible(&self, req: &PlacementRequirements) -> bool {
        !self.evacuating && req.capabilities.iter().all(|c| self.offers(c))
    }

    pub fn has_room(&self, req: &PlacementRequirements) -> bool {
        self.available.memory_mb >= req.memory_mb
            && self.available.disk_mb >= req.disk_mb
            && self.available.containers >= 1
    }

    /// Load of the cell if `req` were placed on it. Lower is better.
    pub fn load_after(
        &self,
        req: &PlacementRequirements,
        process_guid: Option<&str>,
        weights: &ScoringWeights,
    ) -> f64 {
        let memory = utilization(
            self.total.memory_mb,
            self.available.memory_mb.saturating_sub(req.memory_mb),
        );
        let disk = utilization(
            self.total.disk_mb,
            self.available.disk_mb.saturating_sub(req.disk_mb),
        );
        let containers = utilization(
            u64::from(self.total.containers),
            u64::from(self.available.containers.saturating_sub(1)),
        );
        let mut load = (memory + disk + containers) / 3.0;

        if self.total.containers > 0 {
            load += weights.starting_container_weight * f64::from(self.starting_containers)
                / f64::from(self.total.containers);
        }
        if let Some(guid) = process_guid {
            let same = self.lrp_instances.get(guid).copied().unwrap_or(0);
            load += weights.process_spread_weight * f64::from(same);
        }
        load
    }

    /// Account for `req` having been assigned here in the current round.
    pub fn reserve(&mut self, req: &PlacementRequirements, process_guid: Option<&str>) {
        self.available.memory_mb = self.available.memory_mb.saturating_sub(req.memory_mb);
        self.available.disk_mb = self.available.disk_mb.saturating_sub(req.disk_mb);
        self.available.containers = self.available.containers.saturating_sub(1);
        self.starting_containers += 1;
        if let Some(guid) = process_guid {
            *self.lrp_instances.entry(guid.to_string()).or_default() += 1;
        }
    }
}

fn utilization(total: u64, remaining: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    1.0 - remaining as f64 / total as f64
}
