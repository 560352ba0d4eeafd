//! Cell presence leases.

use tracing::debug;

use crate::error::StateResult;
use crate::events::StoreEvent;
use crate::store::{StateStore, get_json, put_versioned, remove_key};
use crate::tables::CELLS;
use crate::types::{CellPresence, epoch_millis};

impl StateStore {
    /// Insert or renew a cell's presence.
    pub fn put_cell_presence(&self, mut presence: CellPresence) -> StateResult<CellPresence> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let is_new = {
            let mut table = txn.open_table(CELLS).map_err(map_err!(Table))?;
            let current: Option<CellPresence> = get_json(&table, &presence.cell_id)?;
            presence.modification_index = current.as_ref().map_or(0, |c| c.modification_index);
            put_versioned(&mut table, &presence.cell_id.clone(), &mut presence)?;
            current.is_none_or(|c| !c.is_live(epoch_millis()))
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if is_new {
            debug!(cell_id = %presence.cell_id, "cell presence registered");
            self.emit([StoreEvent::CellChanged {
                cell_id: presence.cell_id.clone(),
            }]);
        }
        Ok(presence)
    }

    pub fn remove_cell_presence(&self, cell_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(CELLS).map_err(map_err!(Table))?;
            remove_key(&mut table, cell_id)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            debug!(%cell_id, "cell presence removed");
            self.emit([StoreEvent::CellRemoved {
                cell_id: cell_id.to_string(),
            }]);
        }
        Ok(existed)
    }

    /// Cells whose lease is still valid at `now`, ordered by ID.
    pub fn cells(&self, now: u64) -> StateResult<Vec<CellPresence>> {
        Ok(self
            .all_cells()?
            .into_iter()
            .filter(|c| c.is_live(now))
            .collect())
    }

    /// Every stored presence, expired or not.
    pub fn all_cells(&self) -> StateResult<Vec<CellPresence>> {
        self.read_all(CELLS, None)
    }

    pub fn cell_presence(&self, cell_id: &str) -> StateResult<Option<CellPresence>> {
        self.read_one(CELLS, cell_id)
    }
}
