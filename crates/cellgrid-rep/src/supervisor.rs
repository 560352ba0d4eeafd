//! Per-container supervision.
//!
//! Every accepted LRP instance or task gets one supervisor task. It creates
//! the container, runs the actions, reports the outcome to the store and
//! tears the container down. A supervisor stopped through its shutdown
//! channel tears down without reporting; whoever stopped it owns the store
//! update.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use cellgrid_core::{CellConfig, format_duration};
use cellgrid_placement::AuctioneerHandle;
use cellgrid_state::{
    ActualLrpKey, DesiredLrp, EnvVar, NetInfo, StateError, StateStore, Task,
    lrp_container_handle,
};

use crate::error::{RepError, RepResult};
use crate::ledger::CapacityLedger;
use crate::monitor::{ProbeStatus, ProbeTracker};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::steps::StepRunner;
use crate::transfer::{DownloadCache, Transfer};

/// Shared state of one cell.
pub(crate) struct CellContext {
    pub config: CellConfig,
    pub store: StateStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub transfer: Arc<dyn Transfer>,
    pub cache: DownloadCache,
    pub ledger: CapacityLedger,
    pub auctioneer: RwLock<Option<AuctioneerHandle>>,
    /// Supervisors keyed by container handle.
    pub workers: RwLock<HashMap<String, Worker>>,
    pub evacuating: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    Lrp {
        key: ActualLrpKey,
        instance_guid: String,
    },
    Task {
        task_guid: String,
    },
}

pub(crate) struct Worker {
    pub kind: WorkerKind,
    /// Set once the container exists in the runtime.
    pub created: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    /// Signal the supervisor and wait until its container is gone.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "supervisor task failed");
        }
    }
}

/// The instance or task has moved on without us; nothing to report.
pub(crate) fn is_stale(err: &StateError) -> bool {
    err.is_conflict() || err.is_not_found() || matches!(err, StateError::InvalidTransition { .. })
}

impl CellContext {
    pub fn steps(&self, handle: &str) -> StepRunner {
        StepRunner::new(
            self.runtime.clone(),
            self.transfer.clone(),
            self.cache.clone(),
            handle,
        )
    }

    pub fn is_evacuating(&self) -> bool {
        self.evacuating.load(Ordering::SeqCst)
    }

    pub async fn take_worker(&self, handle: &str) -> Option<Worker> {
        self.workers.write().await.remove(handle)
    }

    /// Handle, kind and created flag of every live supervisor.
    pub async fn worker_list(&self) -> Vec<(String, WorkerKind, bool)> {
        self.workers
            .read()
            .await
            .iter()
            .map(|(handle, w)| {
                (
                    handle.clone(),
                    w.kind.clone(),
                    w.created.load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    pub async fn request_restart(&self, key: &ActualLrpKey) {
        match self.auctioneer.read().await.as_ref() {
            Some(auctioneer) => auctioneer.request_lrp_starts([key.clone()]),
            None => debug!(%key, "no auctioneer attached, converger will restart"),
        }
    }

    /// Record a crash for an instance this cell owns and restart it if the
    /// crash policy says so.
    pub async fn report_crash(&self, key: &ActualLrpKey, instance_guid: &str, reason: &str) {
        match self
            .store
            .crash_actual_lrp(key, instance_guid, &self.config.id, reason)
        {
            Ok(outcome) => {
                if outcome.restart_now {
                    self.request_restart(key).await;
                }
            }
            Err(e) if is_stale(&e) => debug!(%key, error = %e, "instance moved on, crash not recorded"),
            Err(e) => warn!(%key, error = %e, "failed to record crash"),
        }
    }

    /// Report a task failure on behalf of a container this cell lost.
    pub fn fail_running_task(&self, task_guid: &str, reason: &str) {
        match self
            .store
            .complete_task(task_guid, &self.config.id, true, reason, "")
        {
            Ok(_) => {}
            Err(e) if is_stale(&e) => debug!(%task_guid, error = %e, "task moved on"),
            Err(e) => warn!(%task_guid, error = %e, "failed to fail task"),
        }
    }

    async fn teardown(&self, handle: &str) {
        if let Err(e) = self.runtime.destroy(handle).await {
            warn!(%handle, error = %e, "failed to destroy container");
        }
        self.ledger.release(handle).await;
        self.workers.write().await.remove(handle);
    }

    pub async fn spawn_lrp(self: &Arc<Self>, desired: DesiredLrp, key: ActualLrpKey, instance_guid: String) {
        let handle = lrp_container_handle(&key.process_guid, &instance_guid);
        let kind = WorkerKind::Lrp {
            key: key.clone(),
            instance_guid: instance_guid.clone(),
        };
        let ctx = self.clone();
        self.spawn_worker(handle, kind, move |created, shutdown| {
            supervise_lrp(ctx, desired, key, instance_guid, created, shutdown)
        })
        .await;
    }

    pub async fn spawn_task(self: &Arc<Self>, task: Task) {
        let kind = WorkerKind::Task {
            task_guid: task.task_guid.clone(),
        };
        let ctx = self.clone();
        self.spawn_worker(task.task_guid.clone(), kind, move |created, shutdown| {
            supervise_task(ctx, task, created, shutdown)
        })
        .await;
    }

    async fn spawn_worker<F, Fut>(&self, handle: String, kind: WorkerKind, supervise: F)
    where
        F: FnOnce(Arc<AtomicBool>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let created = Arc::new(AtomicBool::new(false));
        // Insert under the lock so a fast supervisor cannot remove itself
        // before it is registered.
        let mut workers = self.workers.write().await;
        let task = tokio::spawn(supervise(created.clone(), shutdown_rx));
        workers.insert(
            handle,
            Worker {
                kind,
                created,
                shutdown_tx,
                task,
            },
        );
    }
}

// ── LRP instances ──────────────────────────────────────────────────

async fn supervise_lrp(
    ctx: Arc<CellContext>,
    desired: DesiredLrp,
    key: ActualLrpKey,
    instance_guid: String,
    created: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let handle = lrp_container_handle(&key.process_guid, &instance_guid);
    let outcome = tokio::select! {
        result = run_lrp(&ctx, &desired, &key, &instance_guid, &created) => Some(result),
        _ = shutdown.changed() => None,
    };

    match outcome {
        Some(err) => {
            // Report before releasing so reconcile never sees a live row
            // without a supervisor or reservation.
            ctx.report_crash(&key, &instance_guid, &err.to_string()).await;
        }
        None => debug!(%key, %instance_guid, "instance stopped"),
    }
    ctx.teardown(&handle).await;
}

/// Runs until the instance fails. The returned error is the crash reason.
async fn run_lrp(
    ctx: &CellContext,
    desired: &DesiredLrp,
    key: &ActualLrpKey,
    instance_guid: &str,
    created: &AtomicBool,
) -> RepError {
    match start_lrp(ctx, desired, key, instance_guid, created).await {
        Ok(()) => RepError::Exited { status: 0 },
        Err(e) => e,
    }
}

async fn start_lrp(
    ctx: &CellContext,
    desired: &DesiredLrp,
    key: &ActualLrpKey,
    instance_guid: &str,
    created: &AtomicBool,
) -> RepResult<()> {
    let spec = lrp_container_spec(&ctx.config, desired, key, instance_guid);
    let handle = spec.handle.clone();
    let info = ctx.runtime.create(spec).await?;
    created.store(true, Ordering::SeqCst);
    debug!(%key, %instance_guid, address = %info.address, "container created");

    let steps = ctx.steps(&handle);
    steps.install_dependencies(&desired.cached_dependencies).await?;
    if let Some(setup) = &desired.setup {
        steps.execute(setup).await?;
    }

    let net_info = NetInfo {
        address: info.address,
        ports: info.ports,
    };
    tokio::select! {
        result = steps.execute(&desired.action) => result,
        result = monitor_lrp(ctx, desired, key, instance_guid, &steps, net_info) => result,
    }
}

/// Probe the instance until it fails. Marks it running on the first
/// passing probe, or immediately when there is no monitor.
async fn monitor_lrp(
    ctx: &CellContext,
    desired: &DesiredLrp,
    key: &ActualLrpKey,
    instance_guid: &str,
    steps: &StepRunner,
    net_info: NetInfo,
) -> RepResult<()> {
    let Some(monitor) = &desired.monitor else {
        mark_running(ctx, key, instance_guid, steps.handle(), net_info).await?;
        return std::future::pending().await;
    };

    let start_timeout = Duration::from_millis(desired.start_timeout_ms);
    let started = Instant::now();
    let mut tracker = ProbeTracker::new(
        ctx.config.probe_interval,
        ctx.config.healthy_probe_interval,
    );
    let mut net_info = Some(net_info);

    loop {
        let probe = steps.execute(monitor).await;
        match tracker.record(probe.is_ok()) {
            ProbeStatus::Healthy => {
                if let Some(net_info) = net_info.take() {
                    mark_running(ctx, key, instance_guid, steps.handle(), net_info).await?;
                }
            }
            ProbeStatus::Unhealthy => {
                let reason = probe.err().map(|e| e.to_string()).unwrap_or_default();
                return Err(RepError::Step(format!("Instance became unhealthy: {reason}")));
            }
            ProbeStatus::Starting => {
                if desired.start_timeout_ms > 0 && started.elapsed() >= start_timeout {
                    let reason = probe.err().map(|e| e.to_string()).unwrap_or_default();
                    return Err(RepError::Step(format!(
                        "Instance never healthy after {}: {reason}",
                        format_duration(start_timeout)
                    )));
                }
            }
        }
        tokio::time::sleep(tracker.next_interval()).await;
    }
}

async fn mark_running(
    ctx: &CellContext,
    key: &ActualLrpKey,
    instance_guid: &str,
    handle: &str,
    net_info: NetInfo,
) -> RepResult<()> {
    ctx.store
        .start_actual_lrp(key, instance_guid, &ctx.config.id, net_info)?;
    ctx.ledger.mark_running(handle).await;
    Ok(())
}

fn env_var(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn lrp_container_spec(
    config: &CellConfig,
    desired: &DesiredLrp,
    key: &ActualLrpKey,
    instance_guid: &str,
) -> ContainerSpec {
    let mut env = vec![
        env_var("INSTANCE_GUID", instance_guid),
        env_var("INSTANCE_INDEX", key.index),
        env_var("CELL_ID", &config.id),
    ];
    if let Some(port) = desired.ports.first() {
        env.push(env_var("PORT", port));
    }
    ContainerSpec {
        handle: lrp_container_handle(&key.process_guid, instance_guid),
        rootfs: desired.rootfs.clone(),
        resources: desired.resources,
        privileged: desired.privileged,
        env,
        properties: desired.properties.clone(),
        volume_mounts: desired.volume_mounts.clone(),
        egress_rules: desired.egress_rules.clone(),
        ports: desired.ports.clone(),
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

async fn supervise_task(
    ctx: Arc<CellContext>,
    task: Task,
    created: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let task_guid = task.task_guid.clone();
    let outcome = tokio::select! {
        result = run_task(&ctx, &task, &created) => Some(result),
        _ = shutdown.changed() => None,
    };

    match outcome {
        Some(Ok(result)) => {
            match ctx
                .store
                .complete_task(&task_guid, &ctx.config.id, false, "", &result)
            {
                Ok(_) => {}
                Err(e) if is_stale(&e) => debug!(%task_guid, error = %e, "task moved on"),
                Err(e) => warn!(%task_guid, error = %e, "failed to complete task"),
            }
        }
        Some(Err(e)) => ctx.fail_running_task(&task_guid, &e.to_string()),
        None => debug!(%task_guid, "task stopped"),
    }
    ctx.teardown(&task_guid).await;
}

/// Runs the task to completion and returns the result file's contents.
async fn run_task(ctx: &CellContext, task: &Task, created: &AtomicBool) -> RepResult<String> {
    let handle = task.task_guid.as_str();
    let spec = ContainerSpec {
        handle: handle.to_string(),
        rootfs: task.rootfs.clone(),
        resources: task.resources,
        privileged: task.privileged,
        env: vec![env_var("CELL_ID", &ctx.config.id)],
        properties: task.properties.clone(),
        volume_mounts: task.volume_mounts.clone(),
        egress_rules: task.egress_rules.clone(),
        ports: Vec::new(),
    };
    ctx.runtime.create(spec).await?;
    created.store(true, Ordering::SeqCst);
    ctx.ledger.mark_running(handle).await;

    let steps = ctx.steps(handle);
    steps.install_dependencies(&task.cached_dependencies).await?;
    steps.execute(&task.action).await?;

    match task.result_file.as_deref() {
        Some(path) if !path.is_empty() => {
            let raw = ctx
                .runtime
                .stream_out(handle, path)
                .await
                .map_err(|e| RepError::Step(format!("failed to fetch result: {e}")))?;
            Ok(String::from_utf8_lossy(&raw).into_owned())
        }
        _ => Ok(String::new()),
    }
}
