//! Desired and actual LRP lifecycle.

use std::time::Duration;

use tracing::{debug, info};

use crate::crash_policy::RestartDecision;
use crate::error::{StateError, StateResult};
use crate::events::StoreEvent;
use crate::store::{StateStore, get_json, put_versioned, remove_key, scan_json};
use crate::tables::{ACTUAL_LRPS, DESIRED_LRPS};
use crate::types::*;

/// Result of changing a desired LRP.
#[derive(Debug, Clone)]
pub struct DesiredLrpUpdateOutcome {
    pub desired: DesiredLrp,
    /// Unclaimed rows created for new indices; these need placing.
    pub created: Vec<ActualLrpKey>,
    /// Instances at indices beyond the new instance count.
    pub excess: Vec<ActualLrp>,
}

#[derive(Debug, Clone)]
pub struct CrashOutcome {
    pub actual: ActualLrp,
    /// The instance went straight back to Unclaimed and should be auctioned.
    pub restart_now: bool,
}

fn prefix_of(process_guid: &str) -> String {
    format!("{process_guid}:")
}

impl StateStore {
    // ── Desired LRPs ───────────────────────────────────────────────

    /// Store a new desired LRP and create an Unclaimed row per instance.
    ///
    /// Returns the keys of the rows that need placing.
    pub fn desire_lrp(&self, mut lrp: DesiredLrp) -> StateResult<Vec<ActualLrpKey>> {
        lrp.validate()?;
        let now = epoch_millis();
        lrp.created_at = now;
        lrp.updated_at = now;
        lrp.modification_index = 0;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created = {
            let mut desired = txn.open_table(DESIRED_LRPS).map_err(map_err!(Table))?;
            if get_json::<DesiredLrp, _>(&desired, &lrp.process_guid)?.is_some() {
                return Err(StateError::AlreadyExists(lrp.process_guid));
            }
            put_versioned(&mut desired, &lrp.process_guid.clone(), &mut lrp)?;

            let mut actuals = txn.open_table(ACTUAL_LRPS).map_err(map_err!(Table))?;
            let mut created = Vec::new();
            for index in 0..lrp.instances {
                let key = ActualLrpKey::new(lrp.process_guid.clone(), index);
                let table_key = key.table_key();
                if get_json::<ActualLrp, _>(&actuals, &table_key)?.is_none() {
                    let mut actual = ActualLrp::unclaimed(&key, &lrp.domain, now);
                    put_versioned(&mut actuals, &table_key, &mut actual)?;
                    created.push(key);
                }
            }
            created
        };
        txn.commit().map_err(map_err!(Transaction))?;

        info!(process_guid = %lrp.process_guid, instances = lrp.instances, "desired lrp created");
        self.emit(
            std::iter::once(StoreEvent::DesiredLrpChanged {
                process_guid: lrp.process_guid.clone(),
            })
            .chain(created.iter().map(|key| StoreEvent::ActualLrpChanged {
                key: key.clone(),
                state: ActualLrpState::Unclaimed,
            })),
        );
        Ok(created)
    }

    /// Apply an update. Growing creates Unclaimed rows for the new indices;
    /// shrinking reports the excess instances for the caller to retire.
    pub fn update_desired_lrp(
        &self,
        process_guid: &str,
        update: &DesiredLrpUpdate,
    ) -> StateResult<DesiredLrpUpdateOutcome> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut desired_table = txn.open_table(DESIRED_LRPS).map_err(map_err!(Table))?;
            let mut desired: DesiredLrp = get_json(&desired_table, process_guid)?
                .ok_or_else(|| StateError::NotFound(process_guid.to_string()))?;
            if let Some(instances) = update.instances {
                desired.instances = instances;
            }
            if let Some(routes) = &update.routes {
                desired.routes = routes.clone();
            }
            if let Some(annotation) = &update.annotation {
                desired.annotation = annotation.clone();
            }
            desired.updated_at = now;
            put_versioned(&mut desired_table, process_guid, &mut desired)?;

            let mut actuals = txn.open_table(ACTUAL_LRPS).map_err(map_err!(Table))?;
            let prefix = prefix_of(process_guid);
            let mut existing: Vec<ActualLrp> = scan_json(&actuals, Some(prefix.as_str()))?;
            // An update is a redeploy: surviving instances start a fresh crash history.
            let mut reset = Vec::new();
            for actual in existing.iter_mut() {
                if actual.index < desired.instances && actual.crash_count > 0 {
                    actual.crash_count = 0;
                    put_versioned(&mut actuals, &actual.key().table_key(), actual)?;
                    reset.push((actual.key(), actual.state));
                }
            }
            let mut created = Vec::new();
            for index in 0..desired.instances {
                if existing.iter().any(|a| a.index == index) {
                    continue;
                }
                let key = ActualLrpKey::new(process_guid, index);
                let mut actual = ActualLrp::unclaimed(&key, &desired.domain, now);
                put_versioned(&mut actuals, &key.table_key(), &mut actual)?;
                created.push(key);
            }
            let excess = existing
                .into_iter()
                .filter(|a| a.index >= desired.instances)
                .collect();
            (
                DesiredLrpUpdateOutcome {
                    desired,
                    created,
                    excess,
                },
                reset,
            )
        };
        txn.commit().map_err(map_err!(Transaction))?;
        let (outcome, reset) = outcome;

        info!(
            %process_guid,
            instances = outcome.desired.instances,
            created = outcome.created.len(),
            excess = outcome.excess.len(),
            crash_counts_reset = reset.len(),
            "desired lrp updated"
        );
        self.emit(
            std::iter::once(StoreEvent::DesiredLrpChanged {
                process_guid: process_guid.to_string(),
            })
            .chain(outcome.created.iter().map(|key| StoreEvent::ActualLrpChanged {
                key: key.clone(),
                state: ActualLrpState::Unclaimed,
            }))
            .chain(
                reset
                    .into_iter()
                    .map(|(key, state)| StoreEvent::ActualLrpChanged { key, state }),
            ),
        );
        Ok(outcome)
    }

    /// Remove a desired LRP together with all of its actual rows.
    ///
    /// Returns the removed rows so owning cells can be told to stop them.
    pub fn remove_desired_lrp(&self, process_guid: &str) -> StateResult<Vec<ActualLrp>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut desired = txn.open_table(DESIRED_LRPS).map_err(map_err!(Table))?;
            if !remove_key(&mut desired, process_guid)? {
                return Err(StateError::NotFound(process_guid.to_string()));
            }
            let mut actuals = txn.open_table(ACTUAL_LRPS).map_err(map_err!(Table))?;
            let prefix = prefix_of(process_guid);
            let removed: Vec<ActualLrp> = scan_json(&actuals, Some(prefix.as_str()))?;
            for actual in &removed {
                remove_key(&mut actuals, &actual.key().table_key())?;
            }
            removed
        };
        txn.commit().map_err(map_err!(Transaction))?;

        info!(%process_guid, instances = removed.len(), "desired lrp removed");
        self.emit(
            std::iter::once(StoreEvent::DesiredLrpRemoved {
                process_guid: process_guid.to_string(),
            })
            .chain(
                removed
                    .iter()
                    .map(|a| StoreEvent::ActualLrpRemoved { key: a.key() }),
            ),
        );
        Ok(removed)
    }

    pub fn desired_lrp_by_process_guid(&self, process_guid: &str) -> StateResult<DesiredLrp> {
        self.read_one(DESIRED_LRPS, process_guid)?
            .ok_or_else(|| StateError::NotFound(process_guid.to_string()))
    }

    pub fn desired_lrps(&self) -> StateResult<Vec<DesiredLrp>> {
        self.read_all(DESIRED_LRPS, None)
    }

    // ── Actual LRPs ────────────────────────────────────────────────

    pub fn actual_lrp(&self, key: &ActualLrpKey) -> StateResult<Option<ActualLrp>> {
        self.read_one(ACTUAL_LRPS, &key.table_key())
    }

    pub fn actual_lrps(&self) -> StateResult<Vec<ActualLrp>> {
        self.read_all(ACTUAL_LRPS, None)
    }

    /// Instances claimed by or running on one cell.
    pub fn actual_lrps_by_cell(&self, cell_id: &str) -> StateResult<Vec<ActualLrp>> {
        Ok(self
            .actual_lrps()?
            .into_iter()
            .filter(|a| a.is_owned() && a.cell_id == cell_id)
            .collect())
    }

    pub fn actual_lrp_groups_by_process_guid(
        &self,
        process_guid: &str,
    ) -> StateResult<Vec<ActualLrpGroup>> {
        let mut actuals: Vec<ActualLrp> =
            self.read_all(ACTUAL_LRPS, Some(prefix_of(process_guid).as_str()))?;
        actuals.sort_by_key(|a| a.index);
        Ok(actuals
            .into_iter()
            .map(|a| ActualLrpGroup {
                instance: Some(a),
                evacuating: None,
            })
            .collect())
    }

    pub fn actual_lrp_group_by_process_guid_and_index(
        &self,
        process_guid: &str,
        index: u32,
    ) -> StateResult<ActualLrpGroup> {
        let key = ActualLrpKey::new(process_guid, index);
        let actual = self
            .actual_lrp(&key)?
            .ok_or_else(|| StateError::NotFound(key.to_string()))?;
        Ok(ActualLrpGroup {
            instance: Some(actual),
            evacuating: None,
        })
    }

    pub fn create_unclaimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        domain: &str,
    ) -> StateResult<ActualLrp> {
        let table_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let actual = {
            let mut table = txn.open_table(ACTUAL_LRPS).map_err(map_err!(Table))?;
            if get_json::<ActualLrp, _>(&table, &table_key)?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            let mut actual = ActualLrp::unclaimed(key, domain, epoch_millis());
            put_versioned(&mut table, &table_key, &mut actual)?;
            actual
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "unclaimed actual lrp created");
        self.emit_actual(&actual);
        Ok(actual)
    }

    /// Unclaimed → Claimed by `cell_id`. Claiming again with the same
    /// instance is a no-op; anyone else gets `Conflict`.
    pub fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_guid: &str,
        cell_id: &str,
    ) -> StateResult<ActualLrp> {
        let (actual, changed) = self.mutate::<ActualLrp, _>(ACTUAL_LRPS, &key.table_key(), |a| {
            if a.owned_by(instance_guid, cell_id) {
                return Ok(false);
            }
            if a.state != ActualLrpState::Unclaimed {
                return Err(StateError::Conflict(format!(
                    "{key} is {} on {:?}",
                    a.state, a.cell_id
                )));
            }
            a.state = ActualLrpState::Claimed;
            a.instance_guid = instance_guid.to_string();
            a.cell_id = cell_id.to_string();
            a.placement_error = None;
            a.since = epoch_millis();
            Ok(true)
        })?;
        if changed {
            debug!(%key, %cell_id, %instance_guid, "actual lrp claimed");
            self.emit_actual(&actual);
        }
        Ok(actual)
    }

    /// Claimed → Running, recording where the instance listens.
    pub fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_guid: &str,
        cell_id: &str,
        net_info: NetInfo,
    ) -> StateResult<ActualLrp> {
        let (actual, changed) = self.mutate::<ActualLrp, _>(ACTUAL_LRPS, &key.table_key(), |a| {
            if !a.owned_by(instance_guid, cell_id) {
                return Err(StateError::Conflict(format!(
                    "{key} is not owned by {cell_id}/{instance_guid}"
                )));
            }
            if a.state == ActualLrpState::Running && a.net_info.as_ref() == Some(&net_info) {
                return Ok(false);
            }
            a.state = ActualLrpState::Running;
            a.net_info = Some(net_info);
            a.since = epoch_millis();
            Ok(true)
        })?;
        if changed {
            info!(%key, %cell_id, "actual lrp running");
            self.emit_actual(&actual);
        }
        Ok(actual)
    }

    /// Record a crash of an owned instance and apply the restart policy.
    ///
    /// Early crashes go straight back to Unclaimed (`restart_now`); later
    /// ones stay Crashed until the converger sees the backoff elapse.
    pub fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_guid: &str,
        cell_id: &str,
        reason: &str,
    ) -> StateResult<CrashOutcome> {
        let policy = self.crash_policy;
        let mut restart_now = false;
        let (actual, _) = self.mutate::<ActualLrp, _>(ACTUAL_LRPS, &key.table_key(), |a| {
            if !a.owned_by(instance_guid, cell_id) {
                return Err(StateError::Conflict(format!(
                    "{key} is not owned by {cell_id}/{instance_guid}"
                )));
            }
            a.crash_count = a.crash_count.saturating_add(1);
            a.crash_reason = Some(reason.to_string());
            a.net_info = None;
            a.since = epoch_millis();
            restart_now = policy.decide(a.crash_count, Duration::ZERO) == RestartDecision::RestartNow;
            if restart_now {
                a.state = ActualLrpState::Unclaimed;
                a.instance_guid.clear();
                a.cell_id.clear();
            } else {
                a.state = ActualLrpState::Crashed;
            }
            Ok(true)
        })?;
        info!(
            %key,
            %cell_id,
            crash_count = actual.crash_count,
            restart_now,
            %reason,
            "actual lrp crashed"
        );
        self.emit_actual(&actual);
        Ok(CrashOutcome {
            actual,
            restart_now,
        })
    }

    /// Record why an Unclaimed instance could not be placed.
    pub fn fail_actual_lrp(
        &self,
        key: &ActualLrpKey,
        placement_error: &str,
    ) -> StateResult<ActualLrp> {
        let (actual, changed) = self.mutate::<ActualLrp, _>(ACTUAL_LRPS, &key.table_key(), |a| {
            if a.state != ActualLrpState::Unclaimed {
                return Err(StateError::Conflict(format!("{key} is {}", a.state)));
            }
            if a.placement_error.as_deref() == Some(placement_error) {
                return Ok(false);
            }
            a.placement_error = Some(placement_error.to_string());
            Ok(true)
        })?;
        if changed {
            info!(%key, %placement_error, "actual lrp placement failed");
            self.emit_actual(&actual);
        }
        Ok(actual)
    }

    /// Stamp an Unclaimed row as just handed to the auctioneer.
    ///
    /// `since` moves to now, so the next retry waits a full window. The
    /// placement error is kept.
    pub fn requeue_actual_lrp(
        &self,
        key: &ActualLrpKey,
        expected_index: u64,
    ) -> StateResult<ActualLrp> {
        let (actual, _) = self.mutate::<ActualLrp, _>(ACTUAL_LRPS, &key.table_key(), |a| {
            if a.modification_index != expected_index || a.state != ActualLrpState::Unclaimed {
                return Err(StateError::Conflict(format!(
                    "{key} moved on ({} at index {})",
                    a.state, a.modification_index
                )));
            }
            a.since = epoch_millis();
            Ok(true)
        })?;
        debug!(%key, "actual lrp requeued for placement");
        Ok(actual)
    }

    /// Return an instance to Unclaimed if it is still at `expected_index`.
    ///
    /// Used for crashed instances whose backoff elapsed, instances on dead
    /// cells and evacuation. The crash count is kept.
    pub fn unclaim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        expected_index: u64,
        reason: Option<&str>,
    ) -> StateResult<ActualLrp> {
        let (actual, _) = self.mutate::<ActualLrp, _>(ACTUAL_LRPS, &key.table_key(), |a| {
            if a.modification_index != expected_index {
                return Err(StateError::Conflict(format!(
                    "{key} moved from index {expected_index} to {}",
                    a.modification_index
                )));
            }
            a.state = ActualLrpState::Unclaimed;
            a.instance_guid.clear();
            a.cell_id.clear();
            a.net_info = None;
            a.placement_error = None;
            if let Some(reason) = reason {
                a.crash_reason = Some(reason.to_string());
            }
            a.since = epoch_millis();
            Ok(true)
        })?;
        debug!(%key, ?reason, "actual lrp unclaimed");
        self.emit_actual(&actual);
        Ok(actual)
    }

    /// Delete an actual row. With `instance_guid`, only that instance is
    /// removed; a row that moved on yields `Conflict`.
    pub fn remove_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_guid: Option<&str>,
    ) -> StateResult<bool> {
        let table_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(ACTUAL_LRPS).map_err(map_err!(Table))?;
            match get_json::<ActualLrp, _>(&table, &table_key)? {
                None => false,
                Some(current) => {
                    if instance_guid.is_some_and(|guid| current.instance_guid != guid) {
                        return Err(StateError::Conflict(format!(
                            "{key} now holds instance {:?}",
                            current.instance_guid
                        )));
                    }
                    remove_key(&mut table, &table_key)?
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            debug!(%key, "actual lrp removed");
            self.emit([StoreEvent::ActualLrpRemoved { key: key.clone() }]);
        }
        Ok(existed)
    }

    fn emit_actual(&self, actual: &ActualLrp) {
        self.emit([StoreEvent::ActualLrpChanged {
            key: actual.key(),
            state: actual.state,
        }]);
    }
}
