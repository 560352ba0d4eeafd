//! The seam between the control plane and cells.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use cellgrid_state::{ActualLrp, ActualLrpKey, StateStore};

use crate::auction::Work;
use crate::error::CellClientError;
use crate::scorer::CellState;

/// What the auctioneer and converger may ask of a cell.
#[async_trait]
pub trait CellClient: Send + Sync {
    fn cell_id(&self) -> &str;

    /// Current capabilities and free capacity.
    async fn state(&self) -> Result<CellState, CellClientError>;

    /// Reserve and start `work`. Returns the part the cell could not accept.
    async fn perform(&self, work: Work) -> Result<Work, CellClientError>;

    /// Tear down one LRP instance and drop its actual row.
    async fn stop_lrp_instance(
        &self,
        key: &ActualLrpKey,
        instance_guid: &str,
    ) -> Result<(), CellClientError>;

    /// Stop a running task's container.
    async fn cancel_task(&self, task_guid: &str) -> Result<(), CellClientError>;
}

/// Clients for the cells this control plane can reach, keyed by cell ID.
///
/// Liveness comes from presence leases in the store; the directory only
/// answers how to talk to a cell.
#[derive(Clone, Default)]
pub struct CellDirectory {
    clients: Arc<RwLock<BTreeMap<String, Arc<dyn CellClient>>>>,
}

impl CellDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client: Arc<dyn CellClient>) {
        let cell_id = client.cell_id().to_string();
        debug!(%cell_id, "cell client registered");
        self.clients.write().await.insert(cell_id, client);
    }

    pub async fn deregister(&self, cell_id: &str) -> bool {
        self.clients.write().await.remove(cell_id).is_some()
    }

    pub async fn get(&self, cell_id: &str) -> Option<Arc<dyn CellClient>> {
        self.clients.read().await.get(cell_id).cloned()
    }

    pub async fn cell_ids(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }
}

/// Stop an instance that should no longer run.
///
/// Owned instances go through their cell so the container is torn down;
/// everything else (and instances whose cell is unreachable) is removed from
/// the store directly. The cell's reconcile loop cleans up any container
/// left behind.
pub async fn retire_actual_lrp(
    store: &StateStore,
    cells: &CellDirectory,
    actual: &ActualLrp,
) -> Result<(), CellClientError> {
    let key = actual.key();
    let client = if actual.is_owned() {
        cells.get(&actual.cell_id).await
    } else {
        None
    };
    if let Some(client) = client {
        match client.stop_lrp_instance(&key, &actual.instance_guid).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(%key, cell_id = %actual.cell_id, error = %e, "stop failed, removing row");
            }
        }
    }
    match store.remove_actual_lrp(&key, Some(&actual.instance_guid)) {
        Ok(_) => Ok(()),
        // Someone else already moved the row on.
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
