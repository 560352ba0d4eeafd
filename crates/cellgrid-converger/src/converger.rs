//! The periodic convergence sweep.

use cellgrid_core::ConvergerConfig;
use cellgrid_placement::{AuctioneerHandle, CellDirectory, StartRequest, retire_actual_lrp};
use cellgrid_state::{StateError, StateStore, epoch_millis};
use tracing::{debug, info, warn};

use crate::error::ConvergeResult;
use crate::plan::{CELL_DISAPPEARED, ConvergencePlan, Correction, Snapshot, plan};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeSummary {
    pub created: usize,
    pub started: usize,
    pub restarted: usize,
    pub reclaimed: usize,
    pub retired: usize,
    pub tasks_started: usize,
    pub tasks_failed: usize,
    pub tasks_deleted: usize,
    /// Corrections whose record moved on before they applied.
    pub skipped: usize,
}

impl ConvergeSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Converger {
    store: StateStore,
    cells: CellDirectory,
    auctioneer: AuctioneerHandle,
    config: ConvergerConfig,
}

impl Converger {
    pub fn new(
        store: StateStore,
        cells: CellDirectory,
        auctioneer: AuctioneerHandle,
        config: ConvergerConfig,
    ) -> Self {
        Self {
            store,
            cells,
            auctioneer,
            config,
        }
    }

    pub fn snapshot(&self) -> ConvergeResult<Snapshot> {
        Ok(Snapshot {
            desired: self.store.desired_lrps()?,
            actuals: self.store.actual_lrps()?,
            tasks: self.store.tasks()?,
            cells: self.store.all_cells()?,
            now: epoch_millis(),
        })
    }

    pub fn plan(&self) -> ConvergeResult<ConvergencePlan> {
        let snapshot = self.snapshot()?;
        Ok(plan(&snapshot, self.store.crash_policy(), &self.config))
    }

    /// Plan against a fresh snapshot and apply it.
    pub async fn converge_once(&self) -> ConvergeResult<ConvergeSummary> {
        let plan = self.plan()?;
        self.apply(plan).await
    }

    /// Apply each correction independently. A correction that fails is
    /// logged and left for the next sweep.
    pub async fn apply(&self, plan: ConvergencePlan) -> ConvergeResult<ConvergeSummary> {
        let mut summary = ConvergeSummary::default();
        let mut starts = Vec::new();

        for correction in plan.corrections {
            let description = format!("{correction:?}");
            match self.apply_one(correction, &mut starts, &mut summary).await {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    debug!(correction = %description, error = %e, "correction skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(correction = %description, error = %e, "correction failed");
                    summary.skipped += 1;
                }
            }
        }

        if !starts.is_empty() {
            debug!(count = starts.len(), "requesting starts");
            self.auctioneer.submit(starts);
        }
        Ok(summary)
    }

    async fn apply_one(
        &self,
        correction: Correction,
        starts: &mut Vec<StartRequest>,
        summary: &mut ConvergeSummary,
    ) -> ConvergeResult<()> {
        match correction {
            Correction::CreateInstance { key, domain } => {
                self.store.create_unclaimed_actual_lrp(&key, &domain)?;
                starts.push(StartRequest::Lrp(key));
                summary.created += 1;
            }
            Correction::StartInstance {
                key,
                expected_index,
            } => {
                self.store.requeue_actual_lrp(&key, expected_index)?;
                starts.push(StartRequest::Lrp(key));
                summary.started += 1;
            }
            Correction::RestartInstance {
                key,
                expected_index,
            } => {
                self.store.unclaim_actual_lrp(&key, expected_index, None)?;
                starts.push(StartRequest::Lrp(key));
                summary.restarted += 1;
            }
            Correction::ReclaimInstance {
                key,
                expected_index,
            } => {
                self.store
                    .unclaim_actual_lrp(&key, expected_index, Some(CELL_DISAPPEARED))?;
                info!(%key, "instance reclaimed from lost cell");
                starts.push(StartRequest::Lrp(key));
                summary.reclaimed += 1;
            }
            Correction::RetireInstance { actual } => {
                retire_actual_lrp(&self.store, &self.cells, &actual).await?;
                summary.retired += 1;
            }
            Correction::StartTask { task_guid } => {
                self.store.requeue_task(&task_guid)?;
                starts.push(StartRequest::Task(task_guid));
                summary.tasks_started += 1;
            }
            Correction::FailTask { task_guid, reason } => {
                self.store.fail_task(&task_guid, &reason)?;
                summary.tasks_failed += 1;
            }
            Correction::DeleteTask { task_guid } => {
                match self.store.resolving_task(&task_guid) {
                    Ok(_) => {}
                    // Already resolving.
                    Err(StateError::Conflict(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.store.delete_task(&task_guid)?;
                debug!(%task_guid, "expired task deleted");
                summary.tasks_deleted += 1;
            }
        }
        Ok(())
    }

    /// Sweep on the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "converger started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.converge_once().await {
                        Ok(summary) if !summary.is_empty() => info!(?summary, "converged"),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "convergence sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("converger shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cellgrid_core::AuctioneerConfig;
    use cellgrid_placement::Auctioneer;
    use cellgrid_state::{ActualLrpKey, ActualLrpState, CrashPolicy, TaskState};

    use crate::testing::{desired, task};

    fn config() -> ConvergerConfig {
        ConvergerConfig {
            interval: Duration::from_millis(20),
            ..ConvergerConfig::default()
        }
    }

    /// A converger whose start requests go to an auctioneer nobody runs.
    fn converger(store: &StateStore) -> (Converger, Auctioneer) {
        let cells = CellDirectory::new();
        let (auctioneer, handle) =
            Auctioneer::new(store.clone(), cells.clone(), AuctioneerConfig::default());
        (
            Converger::new(store.clone(), cells, handle, config()),
            auctioneer,
        )
    }

    #[tokio::test]
    async fn missing_row_is_recreated() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_lrp(desired("web", 2)).unwrap();
        let key = ActualLrpKey::new("web", 1);
        store.remove_actual_lrp(&key, None).unwrap();

        let (converger, _auctioneer) = converger(&store);
        let summary = converger.converge_once().await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(
            store.actual_lrp(&key).unwrap().unwrap().state,
            ActualLrpState::Unclaimed
        );
    }

    #[tokio::test]
    async fn lost_cell_work_is_reclaimed_and_failed() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_lrp(desired("web", 1)).unwrap();
        let key = ActualLrpKey::new("web", 0);
        store.claim_actual_lrp(&key, "ig-1", "cell-gone").unwrap();
        store.desire_task(task("t1", TaskState::Pending, 0)).unwrap();
        store.start_task("t1", "cell-gone").unwrap();

        let (converger, _auctioneer) = converger(&store);
        let summary = converger.converge_once().await.unwrap();
        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.tasks_failed, 1);

        let actual = store.actual_lrp(&key).unwrap().unwrap();
        assert_eq!(actual.state, ActualLrpState::Unclaimed);
        assert_eq!(actual.crash_count, 0);
        assert_eq!(actual.crash_reason.as_deref(), Some(CELL_DISAPPEARED));

        let t1 = store.task_by_guid("t1").unwrap();
        assert!(t1.failed);
        assert_eq!(t1.failure_reason, CELL_DISAPPEARED);
    }

    #[tokio::test]
    async fn excess_instances_are_removed() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_lrp(desired("web", 1)).unwrap();
        let extra = ActualLrpKey::new("web", 5);
        store.create_unclaimed_actual_lrp(&extra, "apps").unwrap();

        let (converger, _auctioneer) = converger(&store);
        let summary = converger.converge_once().await.unwrap();
        assert_eq!(summary.retired, 1);
        assert!(store.actual_lrp(&extra).unwrap().is_none());
        assert!(store.actual_lrp(&ActualLrpKey::new("web", 0)).unwrap().is_some());
    }

    #[tokio::test]
    async fn crashed_instance_restarts_after_backoff() {
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_crash_policy(CrashPolicy {
                immediate_restarts: 1,
                base_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_secs(1),
                max_restart_attempts: 10,
            });
        store.desire_lrp(desired("web", 1)).unwrap();
        let key = ActualLrpKey::new("web", 0);
        store.claim_actual_lrp(&key, "ig-1", "cell-a").unwrap();
        let outcome = store.crash_actual_lrp(&key, "ig-1", "cell-a", "boom").unwrap();
        assert!(!outcome.restart_now);

        let (converger, _auctioneer) = converger(&store);
        assert_eq!(converger.converge_once().await.unwrap().restarted, 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(converger.converge_once().await.unwrap().restarted, 1);
        let actual = store.actual_lrp(&key).unwrap().unwrap();
        assert_eq!(actual.state, ActualLrpState::Unclaimed);
        assert_eq!(actual.crash_count, 1);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_lrp(desired("web", 3)).unwrap();
        store
            .remove_actual_lrp(&ActualLrpKey::new("web", 2), None)
            .unwrap();
        store
            .claim_actual_lrp(&ActualLrpKey::new("web", 0), "ig-1", "cell-gone")
            .unwrap();
        store
            .create_unclaimed_actual_lrp(&ActualLrpKey::new("web", 7), "apps")
            .unwrap();

        let (converger, _auctioneer) = converger(&store);
        let first = converger.converge_once().await.unwrap();
        assert!(!first.is_empty());
        assert!(converger.plan().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retried_placements_wait_a_full_window() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_lrp(desired("web", 1)).unwrap();
        let key = ActualLrpKey::new("web", 0);
        store.fail_actual_lrp(&key, "insufficient resources").unwrap();
        store.desire_task(task("t1", TaskState::Pending, 0)).unwrap();

        let cells = CellDirectory::new();
        let (_auctioneer, handle) =
            Auctioneer::new(store.clone(), cells.clone(), AuctioneerConfig::default());
        let converger = Converger::new(
            store.clone(),
            cells,
            handle,
            ConvergerConfig {
                retry_unplaced_after: Duration::from_millis(100),
                ..config()
            },
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        let first = converger.converge_once().await.unwrap();
        assert_eq!(first.started, 1);
        assert_eq!(first.tasks_started, 1);
        assert!(converger.plan().unwrap().is_empty());
        assert!(converger.converge_once().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let later = converger.converge_once().await.unwrap();
        assert_eq!(later.started, 1);
        assert_eq!(later.tasks_started, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let (converger, _auctioneer) = converger(&store);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { converger.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
