//! The cell agent.
//!
//! A `Rep` answers auctions for its cell, supervises the containers it won,
//! keeps its presence lease alive and periodically reconciles what the
//! runtime holds against what the store says the cell owns.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cellgrid_core::CellConfig;
use cellgrid_placement::{AuctioneerHandle, CellClient, CellClientError, CellState, Work};
use cellgrid_state::{
    ActualLrpKey, CellCapacity, CellPresence, StateStore, TaskState, epoch_millis,
    lrp_container_handle,
};

use crate::error::{RepError, RepResult};
use crate::ledger::{CapacityLedger, ReserveOutcome};
use crate::runtime::ContainerRuntime;
use crate::supervisor::{CellContext, WorkerKind, is_stale};
use crate::transfer::{DownloadCache, Transfer};

const CONTAINER_DISAPPEARED: &str = "container disappeared";
const CELL_EVACUATED: &str = "cell evacuated before task completed";

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Supervisors stopped because their record moved on.
    pub stopped: usize,
    /// Instances crashed or tasks failed because their container is gone.
    pub lost: usize,
    /// Containers with no supervisor that were destroyed.
    pub orphans: usize,
}

#[derive(Clone)]
pub struct Rep {
    ctx: Arc<CellContext>,
}

impl Rep {
    pub fn new(
        config: CellConfig,
        store: StateStore,
        runtime: Arc<dyn ContainerRuntime>,
        transfer: Arc<dyn Transfer>,
    ) -> Self {
        let ledger = CapacityLedger::new(CellCapacity {
            memory_mb: config.memory_mb,
            disk_mb: config.disk_mb,
            containers: config.containers,
        });
        Self {
            ctx: Arc::new(CellContext {
                config,
                store,
                runtime,
                transfer,
                cache: DownloadCache::default(),
                ledger,
                auctioneer: RwLock::new(None),
                workers: RwLock::new(Default::default()),
                evacuating: AtomicBool::new(false),
            }),
        }
    }

    /// Restarts after a crash go straight to this auctioneer.
    pub async fn set_auctioneer(&self, auctioneer: AuctioneerHandle) {
        *self.ctx.auctioneer.write().await = Some(auctioneer);
    }

    pub fn config(&self) -> &CellConfig {
        &self.ctx.config
    }

    pub fn is_evacuating(&self) -> bool {
        self.ctx.is_evacuating()
    }

    /// Container handles with a live supervisor.
    pub async fn container_handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self
            .ctx
            .worker_list()
            .await
            .into_iter()
            .map(|(handle, _, _)| handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn presence(&self) -> CellPresence {
        let config = &self.ctx.config;
        CellPresence {
            cell_id: config.id.clone(),
            zone: config.zone.clone(),
            rep_address: String::new(),
            capacity: CellCapacity {
                memory_mb: config.memory_mb,
                disk_mb: config.disk_mb,
                containers: config.containers,
            },
            stacks: config.stacks.clone(),
            providers: config.providers.clone(),
            volume_drivers: config.volume_drivers.clone(),
            allows_privileged: config.allows_privileged,
            expires_at: epoch_millis() + config.presence_ttl.as_millis() as u64,
            modification_index: 0,
        }
    }

    /// Renew the cell's presence lease.
    pub fn heartbeat(&self) -> RepResult<()> {
        self.ctx.store.put_cell_presence(self.presence())?;
        Ok(())
    }

    pub async fn cell_state(&self) -> CellState {
        let config = &self.ctx.config;
        let snapshot = self.ctx.ledger.snapshot().await;
        CellState {
            cell_id: config.id.clone(),
            zone: config.zone.clone(),
            total: snapshot.total,
            available: snapshot.available,
            stacks: config.stacks.clone(),
            providers: config.providers.clone(),
            volume_drivers: config.volume_drivers.clone(),
            allows_privileged: config.allows_privileged,
            starting_containers: snapshot.starting,
            lrp_instances: snapshot.lrp_instances,
            evacuating: self.is_evacuating(),
        }
    }

    /// Reserve capacity for and start each piece of `work`.
    ///
    /// Returns what the cell could not take. Work that no longer exists or
    /// that another cell already won is dropped rather than returned.
    pub async fn accept(&self, work: Work) -> RepResult<Work> {
        if self.is_evacuating() {
            debug!(count = work.len(), "evacuating, rejecting work");
            return Ok(work);
        }
        let ctx = &self.ctx;
        let cell_id = ctx.config.id.as_str();
        let mut rejected = Work::default();

        for request in work.lrps {
            let key = &request.key;
            let desired = match ctx.store.desired_lrp_by_process_guid(&key.process_guid) {
                Ok(desired) => desired,
                Err(e) if e.is_not_found() => {
                    debug!(%key, "desired lrp removed, dropping");
                    continue;
                }
                Err(e) => {
                    warn!(%key, error = %e, "failed to read desired lrp");
                    rejected.lrps.push(request);
                    continue;
                }
            };

            let instance_guid = Uuid::new_v4().to_string();
            let handle = lrp_container_handle(&key.process_guid, &instance_guid);
            let reserved = ctx
                .ledger
                .try_reserve(&handle, desired.resources, Some(&key.process_guid))
                .await;
            if reserved != ReserveOutcome::Reserved {
                rejected.lrps.push(request);
                continue;
            }

            match ctx.store.claim_actual_lrp(key, &instance_guid, cell_id) {
                Ok(_) => {
                    info!(%key, %instance_guid, "instance claimed");
                    ctx.spawn_lrp(desired, request.key, instance_guid).await;
                }
                Err(e) => {
                    ctx.ledger.release(&handle).await;
                    if is_stale(&e) {
                        debug!(%key, error = %e, "lost claim, dropping");
                    } else {
                        warn!(%key, error = %e, "failed to claim instance");
                        rejected.lrps.push(request);
                    }
                }
            }
        }

        for request in work.tasks {
            let task_guid = request.task_guid.as_str();
            let task = match ctx.store.task_by_guid(task_guid) {
                Ok(task) => task,
                Err(e) if e.is_not_found() => {
                    debug!(%task_guid, "task removed, dropping");
                    continue;
                }
                Err(e) => {
                    warn!(%task_guid, error = %e, "failed to read task");
                    rejected.tasks.push(request);
                    continue;
                }
            };

            match ctx.ledger.try_reserve(task_guid, task.resources, None).await {
                ReserveOutcome::Reserved => {}
                ReserveOutcome::Duplicate => continue,
                ReserveOutcome::NoRoom => {
                    rejected.tasks.push(request);
                    continue;
                }
            }

            match ctx.store.start_task(task_guid, cell_id) {
                Ok(true) => ctx.spawn_task(task).await,
                Ok(false) => {
                    // Started by an earlier incarnation of this cell;
                    // reconcile fails it if nothing runs it any more.
                    ctx.ledger.release(task_guid).await;
                }
                Err(e) => {
                    ctx.ledger.release(task_guid).await;
                    if is_stale(&e) {
                        debug!(%task_guid, error = %e, "task taken elsewhere, dropping");
                    } else {
                        warn!(%task_guid, error = %e, "failed to start task");
                        rejected.tasks.push(request);
                    }
                }
            }
        }

        Ok(rejected)
    }

    /// Tear down one instance and drop its actual row.
    pub async fn stop_instance(&self, key: &ActualLrpKey, instance_guid: &str) -> RepResult<()> {
        let handle = lrp_container_handle(&key.process_guid, instance_guid);
        match self.ctx.take_worker(&handle).await {
            Some(worker) => worker.stop().await,
            None => {
                self.ctx.runtime.destroy(&handle).await?;
                self.ctx.ledger.release(&handle).await;
            }
        }
        match self.ctx.store.remove_actual_lrp(key, Some(instance_guid)) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => debug!(%key, "instance moved on before removal"),
            Err(e) => return Err(e.into()),
        }
        info!(%key, %instance_guid, "instance stopped");
        Ok(())
    }

    /// Stop a task's container. The task record is left to the caller.
    pub async fn stop_task(&self, task_guid: &str) {
        if let Some(worker) = self.ctx.take_worker(task_guid).await {
            worker.stop().await;
            info!(%task_guid, "task container stopped");
        }
    }

    /// Bring the runtime and the store back into agreement.
    pub async fn reconcile(&self) -> RepResult<ReconcileSummary> {
        let ctx = &self.ctx;
        let cell_id = ctx.config.id.as_str();
        let mut summary = ReconcileSummary::default();

        // Supervisors first: one that finishes creating after this snapshot
        // still reads as not created, so a container missing from the list
        // below is really gone.
        let workers = ctx.worker_list().await;
        let containers: HashSet<String> = ctx.runtime.list().await?.into_iter().collect();
        let actuals = ctx.store.actual_lrps_by_cell(cell_id)?;
        let tasks: Vec<_> = ctx
            .store
            .tasks_by_cell(cell_id)?
            .into_iter()
            .filter(|t| t.state == TaskState::Running)
            .collect();

        // Supervisors whose record moved on, or whose container vanished.
        let mut handled = HashSet::new();
        for (handle, kind, created) in workers {
            let wanted = match &kind {
                WorkerKind::Lrp { key, instance_guid } => actuals
                    .iter()
                    .any(|a| a.key() == *key && a.owned_by(instance_guid, cell_id)),
                WorkerKind::Task { task_guid } => tasks.iter().any(|t| t.task_guid == *task_guid),
            };
            let lost = wanted && created && !containers.contains(&handle);
            if wanted && !lost {
                continue;
            }
            let Some(worker) = ctx.take_worker(&handle).await else {
                continue;
            };
            worker.stop().await;
            handled.insert(handle.clone());
            if !lost {
                debug!(%handle, "record moved on, supervisor stopped");
                summary.stopped += 1;
                continue;
            }
            warn!(%handle, "container disappeared");
            summary.lost += 1;
            match kind {
                WorkerKind::Lrp { key, instance_guid } => {
                    ctx.report_crash(&key, &instance_guid, CONTAINER_DISAPPEARED)
                        .await;
                }
                WorkerKind::Task { task_guid } => {
                    ctx.fail_running_task(&task_guid, CONTAINER_DISAPPEARED);
                }
            }
        }

        // Records that say they run here but nothing here runs them. A
        // ledger reservation without a supervisor is a start in flight.
        let supervised: HashSet<String> = ctx
            .worker_list()
            .await
            .into_iter()
            .map(|(handle, _, _)| handle)
            .chain(handled)
            .collect();
        for actual in &actuals {
            let handle = actual.container_handle();
            if supervised.contains(&handle) || ctx.ledger.contains(&handle).await {
                continue;
            }
            warn!(key = %actual.key(), "instance has no container");
            summary.lost += 1;
            ctx.report_crash(&actual.key(), &actual.instance_guid, CONTAINER_DISAPPEARED)
                .await;
        }
        for task in &tasks {
            if supervised.contains(&task.task_guid) || ctx.ledger.contains(&task.task_guid).await {
                continue;
            }
            warn!(task_guid = %task.task_guid, "task has no container");
            summary.lost += 1;
            ctx.fail_running_task(&task.task_guid, CONTAINER_DISAPPEARED);
        }

        // Containers nothing supervises.
        for handle in containers {
            if supervised.contains(&handle) || ctx.ledger.contains(&handle).await {
                continue;
            }
            debug!(%handle, "destroying orphaned container");
            ctx.runtime.destroy(&handle).await?;
            summary.orphans += 1;
        }

        if summary != ReconcileSummary::default() {
            info!(
                stopped = summary.stopped,
                lost = summary.lost,
                orphans = summary.orphans,
                "reconciled"
            );
        }
        Ok(summary)
    }

    /// Hand every instance back for placement elsewhere, give running tasks
    /// until the evacuation timeout to finish, then drop the presence lease.
    pub async fn evacuate(&self) -> RepResult<()> {
        let ctx = &self.ctx;
        if ctx.evacuating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cell_id = ctx.config.id.as_str();
        info!(%cell_id, "evacuating cell");

        for (handle, kind, _) in ctx.worker_list().await {
            let WorkerKind::Lrp { key, instance_guid } = kind else {
                continue;
            };
            if let Some(worker) = ctx.take_worker(&handle).await {
                worker.stop().await;
            }
            let Some(actual) = ctx.store.actual_lrp(&key)? else {
                continue;
            };
            if !actual.owned_by(&instance_guid, cell_id) {
                continue;
            }
            match ctx
                .store
                .unclaim_actual_lrp(&key, actual.modification_index, None)
            {
                Ok(_) => ctx.request_restart(&key).await,
                Err(e) if is_stale(&e) => debug!(%key, error = %e, "instance moved on"),
                Err(e) => warn!(%key, error = %e, "failed to hand back instance"),
            }
        }

        let deadline = tokio::time::Instant::now() + ctx.config.evacuation_timeout;
        loop {
            let running: Vec<String> = ctx
                .worker_list()
                .await
                .into_iter()
                .filter_map(|(_, kind, _)| match kind {
                    WorkerKind::Task { task_guid } => Some(task_guid),
                    WorkerKind::Lrp { .. } => None,
                })
                .collect();
            if running.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                for task_guid in running {
                    self.stop_task(&task_guid).await;
                    match ctx.store.fail_task(&task_guid, CELL_EVACUATED) {
                        Ok(_) => {}
                        Err(e) if is_stale(&e) => debug!(%task_guid, "task moved on"),
                        Err(e) => warn!(%task_guid, error = %e, "failed to fail task"),
                    }
                }
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        ctx.store.remove_cell_presence(cell_id)?;
        info!(%cell_id, "cell evacuated");
        Ok(())
    }

    /// Heartbeat and reconcile until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.ctx.config;
        info!(
            cell_id = %config.id,
            zone = %config.zone,
            memory_mb = config.memory_mb,
            "cell started"
        );
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        let mut poll = tokio::time::interval(config.polling_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if self.is_evacuating() {
                        continue;
                    }
                    if let Err(e) = self.heartbeat() {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconcile failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(cell_id = %config.id, "cell stopping");
                    break;
                }
            }
        }
    }
}

fn refused(cell_id: &str, err: RepError) -> CellClientError {
    CellClientError::Refused {
        cell_id: cell_id.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl CellClient for Rep {
    fn cell_id(&self) -> &str {
        &self.ctx.config.id
    }

    async fn state(&self) -> Result<CellState, CellClientError> {
        Ok(self.cell_state().await)
    }

    async fn perform(&self, work: Work) -> Result<Work, CellClientError> {
        self.accept(work)
            .await
            .map_err(|e| refused(self.cell_id(), e))
    }

    async fn stop_lrp_instance(
        &self,
        key: &ActualLrpKey,
        instance_guid: &str,
    ) -> Result<(), CellClientError> {
        self.stop_instance(key, instance_guid)
            .await
            .map_err(|e| refused(self.cell_id(), e))
    }

    async fn cancel_task(&self, task_guid: &str) -> Result<(), CellClientError> {
        self.stop_task(task_guid).await;
        Ok(())
    }
}
