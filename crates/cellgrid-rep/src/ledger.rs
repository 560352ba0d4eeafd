//! Per-cell capacity ledger.
//!
//! Every container the cell accepts holds a reservation keyed by its
//! container handle. Reservations are checked and taken under one lock so
//! two auctions dispatching at once cannot overbook the cell between state
//! advertisements.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::debug;

use cellgrid_state::{CellCapacity, Resources};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reservation {
    resources: Resources,
    process_guid: Option<String>,
    starting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// The handle already holds a reservation.
    Duplicate,
    NoRoom,
}

/// Point-in-time view used to answer auction state requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub total: CellCapacity,
    pub available: CellCapacity,
    pub starting: u32,
    pub lrp_instances: BTreeMap<String, u32>,
}

pub struct CapacityLedger {
    total: CellCapacity,
    reservations: Mutex<BTreeMap<String, Reservation>>,
}

impl CapacityLedger {
    pub fn new(total: CellCapacity) -> Self {
        Self {
            total,
            reservations: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn try_reserve(
        &self,
        handle: &str,
        resources: Resources,
        process_guid: Option<&str>,
    ) -> ReserveOutcome {
        let mut reservations = self.reservations.lock().await;
        if reservations.contains_key(handle) {
            return ReserveOutcome::Duplicate;
        }
        let available = available(&self.total, &reservations);
        if available.memory_mb < resources.memory_mb
            || available.disk_mb < resources.disk_mb
            || available.containers == 0
        {
            debug!(
                %handle,
                memory_mb = resources.memory_mb,
                available_memory_mb = available.memory_mb,
                "reservation refused"
            );
            return ReserveOutcome::NoRoom;
        }
        reservations.insert(
            handle.to_string(),
            Reservation {
                resources,
                process_guid: process_guid.map(str::to_string),
                starting: true,
            },
        );
        ReserveOutcome::Reserved
    }

    /// The container finished starting; it no longer counts as starting.
    pub async fn mark_running(&self, handle: &str) {
        if let Some(r) = self.reservations.lock().await.get_mut(handle) {
            r.starting = false;
        }
    }

    pub async fn release(&self, handle: &str) -> bool {
        self.reservations.lock().await.remove(handle).is_some()
    }

    pub async fn contains(&self, handle: &str) -> bool {
        self.reservations.lock().await.contains_key(handle)
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let reservations = self.reservations.lock().await;
        let mut lrp_instances = BTreeMap::new();
        for r in reservations.values() {
            if let Some(guid) = &r.process_guid {
                *lrp_instances.entry(guid.clone()).or_insert(0u32) += 1;
            }
        }
        LedgerSnapshot {
            total: self.total,
            available: available(&self.total, &reservations),
            starting: reservations.values().filter(|r| r.starting).count() as u32,
            lrp_instances,
        }
    }
}

fn available(total: &CellCapacity, reservations: &BTreeMap<String, Reservation>) -> CellCapacity {
    let memory: u64 = reservations.values().map(|r| r.resources.memory_mb).sum();
    let disk: u64 = reservations.values().map(|r| r.resources.disk_mb).sum();
    CellCapacity {
        memory_mb: total.memory_mb.saturating_sub(memory),
        disk_mb: total.disk_mb.saturating_sub(disk),
        containers: total
            .containers
            .saturating_sub(reservations.len().min(u32::MAX as usize) as u32),
    }
}
