//! Auctioneer — batches start requests and runs auctions against live cells.
//!
//! Requests arrive on a channel as store keys. Each batch re-reads the
//! records (dropping anything removed or already placed), asks every live
//! cell for its state under a deadline, runs the auction and hands each
//! winner its work under a second deadline. Work a cell rejects or never
//! acknowledges is re-auctioned up to `max_retries` times within the batch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use cellgrid_core::AuctioneerConfig;
use cellgrid_state::{ActualLrpKey, ActualLrpState, StateStore, TaskState, epoch_millis};

use crate::auction::{AuctionFailure, AuctionRequest, Work, run_auction};
use crate::cell_client::{CellClient, CellDirectory};
use crate::convert::{lrp_start_request, task_start_request};
use crate::error::{CellClientError, PlacementError};
use crate::scorer::{CellState, ScoringWeights};

/// A request to place something, by store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StartRequest {
    Lrp(ActualLrpKey),
    Task(String),
}

/// Cheap, cloneable sender for start requests.
#[derive(Clone)]
pub struct AuctioneerHandle {
    tx: mpsc::UnboundedSender<StartRequest>,
}

impl AuctioneerHandle {
    pub fn request_lrp_starts(&self, keys: impl IntoIterator<Item = ActualLrpKey>) {
        self.submit(keys.into_iter().map(StartRequest::Lrp));
    }

    pub fn request_task_start(&self, task_guid: &str) {
        self.submit([StartRequest::Task(task_guid.to_string())]);
    }

    pub fn submit(&self, requests: impl IntoIterator<Item = StartRequest>) {
        for request in requests {
            if self.tx.send(request).is_err() {
                debug!("auctioneer stopped, dropping start request");
                return;
            }
        }
    }
}

/// Counts from one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub placed: usize,
    /// Placement errors recorded on LRPs, plus tasks failed outright.
    pub failed: usize,
    /// Tasks left Pending for a later batch.
    pub deferred: usize,
    /// Requests whose records were gone or already placed.
    pub dropped: usize,
}

pub struct Auctioneer {
    store: StateStore,
    cells: CellDirectory,
    config: AuctioneerConfig,
    weights: ScoringWeights,
    rx: mpsc::UnboundedReceiver<StartRequest>,
}

impl Auctioneer {
    pub fn new(
        store: StateStore,
        cells: CellDirectory,
        config: AuctioneerConfig,
    ) -> (Self, AuctioneerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let weights = ScoringWeights {
            starting_container_weight: config.starting_container_weight,
            ..ScoringWeights::default()
        };
        let auctioneer = Self {
            store,
            cells,
            config,
            weights,
            rx,
        };
        (auctioneer, AuctioneerHandle { tx })
    }

    /// Collect requests for `batch_window`, auction them, repeat.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_window = ?self.config.batch_window, "auctioneer started");
        loop {
            let first = tokio::select! {
                _ = shutdown.changed() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let mut batch = vec![first];
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.batch_window) => {}
            }
            while let Ok(request) = self.rx.try_recv() {
                batch.push(request);
            }

            let size = batch.len();
            let summary = self.run_batch(batch).await;
            info!(
                size,
                placed = summary.placed,
                failed = summary.failed,
                deferred = summary.deferred,
                dropped = summary.dropped,
                "auction batch complete"
            );
        }
        info!("auctioneer stopped");
    }

    pub async fn run_batch(&self, batch: Vec<StartRequest>) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut pending = self.prepare(batch, &mut summary);
        let mut unreachable: HashSet<String> = HashSet::new();

        for round in 0..=self.config.max_retries {
            if pending.is_empty() {
                break;
            }
            let cells = self.fetch_cell_states(&unreachable).await;
            if cells.is_empty() {
                warn!(round, requests = pending.len(), "no cells reachable for auction");
                break;
            }
            let states: Vec<CellState> = cells.values().map(|(state, _)| state.clone()).collect();
            let results = run_auction(std::mem::take(&mut pending), &states, &self.weights);

            for failure in &results.failures {
                self.record_failure(failure, &mut summary);
            }

            for (cell_id, work) in results.work_by_cell() {
                let Some((_, client)) = cells.get(&cell_id) else {
                    pending.extend(work.into_requests());
                    continue;
                };
                let offered = work.len();
                match self.dispatch(client.as_ref(), work.clone()).await {
                    Ok(rejected) => {
                        summary.placed += offered.saturating_sub(rejected.len());
                        if !rejected.is_empty() {
                            debug!(%cell_id, rejected = rejected.len(), "cell rejected work");
                        }
                        pending.extend(rejected.into_requests());
                    }
                    Err(e) => {
                        warn!(%cell_id, error = %e, "work dispatch failed");
                        unreachable.insert(cell_id);
                        pending.extend(work.into_requests());
                    }
                }
            }
        }

        // Out of retries or cells: leave it for the converger.
        for request in pending {
            let failure = AuctionFailure {
                request,
                error: PlacementError::InsufficientResources,
            };
            self.record_failure(&failure, &mut summary);
        }
        summary
    }

    /// Re-read each record and keep only what still needs placing.
    fn prepare(&self, batch: Vec<StartRequest>, summary: &mut BatchSummary) -> Vec<AuctionRequest> {
        let unique: BTreeSet<StartRequest> = batch.into_iter().collect();
        let mut requests = Vec::with_capacity(unique.len());
        for request in unique {
            match self.load_request(&request) {
                Ok(Some(r)) => requests.push(r),
                Ok(None) => summary.dropped += 1,
                Err(e) => {
                    warn!(?request, error = %e, "could not load start request");
                    summary.dropped += 1;
                }
            }
        }
        requests
    }

    fn load_request(
        &self,
        request: &StartRequest,
    ) -> cellgrid_state::StateResult<Option<AuctionRequest>> {
        match request {
            StartRequest::Lrp(key) => {
                let Some(actual) = self.store.actual_lrp(key)? else {
                    return Ok(None);
                };
                if actual.state != ActualLrpState::Unclaimed {
                    return Ok(None);
                }
                let desired = match self.store.desired_lrp_by_process_guid(&key.process_guid) {
                    Ok(desired) => desired,
                    Err(e) if e.is_not_found() => return Ok(None),
                    Err(e) => return Err(e),
                };
                if key.index >= desired.instances {
                    return Ok(None);
                }
                Ok(Some(AuctionRequest::Lrp(lrp_start_request(
                    &desired, key.index,
                )?)))
            }
            StartRequest::Task(task_guid) => {
                let task = match self.store.task_by_guid(task_guid) {
                    Ok(task) => task,
                    Err(e) if e.is_not_found() => return Ok(None),
                    Err(e) => return Err(e),
                };
                if task.state != TaskState::Pending {
                    return Ok(None);
                }
                Ok(Some(AuctionRequest::Task(task_start_request(&task)?)))
            }
        }
    }

    /// State of every live, reachable cell, fetched in parallel under a deadline.
    async fn fetch_cell_states(
        &self,
        unreachable: &HashSet<String>,
    ) -> HashMap<String, (CellState, Arc<dyn CellClient>)> {
        let presences = match self.store.cells(epoch_millis()) {
            Ok(presences) => presences,
            Err(e) => {
                warn!(error = %e, "could not list cells");
                return HashMap::new();
            }
        };

        let mut fetches = JoinSet::new();
        for presence in presences {
            if unreachable.contains(&presence.cell_id) {
                continue;
            }
            let Some(client) = self.cells.get(&presence.cell_id).await else {
                debug!(cell_id = %presence.cell_id, "no client for live cell");
                continue;
            };
            let deadline = self.config.cell_state_timeout;
            fetches.spawn(async move {
                let result = match timeout(deadline, client.state()).await {
                    Ok(result) => result,
                    Err(_) => Err(CellClientError::Timeout {
                        cell_id: client.cell_id().to_string(),
                        timeout_ms: deadline.as_millis() as u64,
                    }),
                };
                (client, result)
            });
        }

        let mut cells = HashMap::new();
        while let Some(joined) = fetches.join_next().await {
            let Ok((client, result)) = joined else {
                continue;
            };
            match result {
                Ok(state) => {
                    cells.insert(state.cell_id.clone(), (state, client));
                }
                Err(e) => warn!(cell_id = %client.cell_id(), error = %e, "cell state unavailable"),
            }
        }
        cells
    }

    async fn dispatch(
        &self,
        client: &dyn CellClient,
        work: Work,
    ) -> Result<Work, CellClientError> {
        let deadline = self.config.perform_timeout;
        match timeout(deadline, client.perform(work)).await {
            Ok(result) => result,
            Err(_) => Err(CellClientError::Timeout {
                cell_id: client.cell_id().to_string(),
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }

    fn record_failure(&self, failure: &AuctionFailure, summary: &mut BatchSummary) {
        let message = failure.error.to_string();
        match &failure.request {
            AuctionRequest::Lrp(r) => match self.store.fail_actual_lrp(&r.key, &message) {
                Ok(_) => summary.failed += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => summary.dropped += 1,
                Err(e) => warn!(key = %r.key, error = %e, "could not record placement error"),
            },
            AuctionRequest::Task(r) if failure.error.is_retryable() => {
                debug!(task_guid = %r.task_guid, "task deferred: {message}");
                summary.deferred += 1;
            }
            AuctionRequest::Task(r) => match self.store.fail_task(&r.task_guid, &message) {
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    debug!(task_guid = %r.task_guid, error = %e, "task moved on before failing");
                    summary.dropped += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use cellgrid_state::*;
    use tokio::sync::Mutex;

    /// A cell that claims work in the store the way a real cell would.
    struct FakeCell {
        id: String,
        store: StateStore,
        state: Mutex<crate::scorer::CellState>,
        hang: bool,
    }

    impl FakeCell {
        fn new(id: &str, store: &StateStore, memory_mb: u64) -> Arc<Self> {
            Self::build(id, store, memory_mb, false)
        }

        fn hanging(id: &str, store: &StateStore) -> Arc<Self> {
            Self::build(id, store, 4096, true)
        }

        fn build(id: &str, store: &StateStore, memory_mb: u64, hang: bool) -> Arc<Self> {
            let capacity = CellCapacity {
                memory_mb,
                disk_mb: memory_mb,
                containers: 50,
            };
            Arc::new(Self {
                id: id.to_string(),
                store: store.clone(),
                state: Mutex::new(crate::scorer::CellState {
                    cell_id: id.to_string(),
                    zone: "z1".to_string(),
                    total: capacity,
                    available: capacity,
                    stacks: vec!["cflinuxfs".to_string()],
                    providers: vec!["docker".to_string()],
                    volume_drivers: vec!["nfs".to_string()],
                    allows_privileged: false,
                    starting_containers: 0,
                    lrp_instances: BTreeMap::new(),
                    evacuating: false,
                }),
                hang,
            })
        }
    }

    #[async_trait]
    impl CellClient for FakeCell {
        fn cell_id(&self) -> &str {
            &self.id
        }

        async fn state(&self) -> Result<crate::scorer::CellState, CellClientError> {
            Ok(self.state.lock().await.clone())
        }

        async fn perform(&self, work: Work) -> Result<Work, CellClientError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let mut state = self.state.lock().await;
            for lrp in &work.lrps {
                let guid = uuid::Uuid::new_v4().to_string();
                self.store.claim_actual_lrp(&lrp.key, &guid, &self.id)?;
                state.reserve(&lrp.requirements, Some(&lrp.key.process_guid));
            }
            for task in &work.tasks {
                self.store.start_task(&task.task_guid, &self.id)?;
                state.reserve(&task.requirements, None);
            }
            Ok(Work::default())
        }

        async fn stop_lrp_instance(
            &self,
            key: &ActualLrpKey,
            instance_guid: &str,
        ) -> Result<(), CellClientError> {
            self.store.remove_actual_lrp(key, Some(instance_guid))?;
            Ok(())
        }

        async fn cancel_task(&self, _task_guid: &str) -> Result<(), CellClientError> {
            Ok(())
        }
    }

    fn config() -> AuctioneerConfig {
        AuctioneerConfig {
            batch_window: Duration::from_millis(10),
            cell_state_timeout: Duration::from_millis(200),
            perform_timeout: Duration::from_millis(100),
            max_retries: 2,
            starting_container_weight: 0.33,
        }
    }

    fn register_presence(store: &StateStore, id: &str) {
        store
            .put_cell_presence(CellPresence {
                cell_id: id.to_string(),
                zone: "z1".to_string(),
                rep_address: String::new(),
                capacity: CellCapacity::default(),
                stacks: vec![],
                providers: vec![],
                volume_drivers: vec![],
                allows_privileged: false,
                expires_at: u64::MAX,
                modification_index: 0,
            })
            .unwrap();
    }

    fn desired(guid: &str, rootfs: &str, instances: u32) -> DesiredLrp {
        DesiredLrp {
            process_guid: guid.to_string(),
            domain: "d".to_string(),
            instances,
            rootfs: rootfs.to_string(),
            setup: None,
            action: Action::run("server", &[]),
            monitor: None,
            start_timeout_ms: 0,
            resources: Resources {
                memory_mb: 128,
                disk_mb: 128,
                max_pids: 0,
            },
            privileged: false,
            volume_mounts: vec![],
            egress_rules: vec![],
            ports: vec![],
            routes: vec![],
            cached_dependencies: vec![],
            properties: Default::default(),
            annotation: String::new(),
            created_at: 0,
            updated_at: 0,
            modification_index: 0,
        }
    }

    fn task(guid: &str, memory_mb: u64, drivers: &[&str]) -> Task {
        Task {
            task_guid: guid.to_string(),
            domain: "d".to_string(),
            rootfs: "preloaded:cflinuxfs".to_string(),
            action: Action::run("true", &[]),
            resources: Resources {
                memory_mb,
                disk_mb: 1,
                max_pids: 0,
            },
            volume_mounts: drivers
                .iter()
                .map(|d| VolumeMount {
                    driver: d.to_string(),
                    volume_id: "vol".to_string(),
                    container_path: "/data".to_string(),
                    mode: MountMode::ReadWrite,
                })
                .collect(),
            egress_rules: vec![],
            privileged: false,
            result_file: None,
            properties: Default::default(),
            cached_dependencies: vec![],
            annotation: String::new(),
            state: TaskState::Pending,
            cell_id: String::new(),
            failed: false,
            failure_reason: String::new(),
            result: String::new(),
            created_at: 0,
            updated_at: 0,
            first_completed_at: None,
            modification_index: 0,
        }
    }

    #[tokio::test]
    async fn places_lrp_instances() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        directory.register(FakeCell::new("cell-a", &store, 4096)).await;
        register_presence(&store, "cell-a");
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), directory, config());

        let keys = store.desire_lrp(desired("web", "preloaded:cflinuxfs", 2)).unwrap();
        let summary = auctioneer
            .run_batch(keys.into_iter().map(StartRequest::Lrp).collect())
            .await;
        assert_eq!(summary.placed, 2);

        for group in store.actual_lrp_groups_by_process_guid("web").unwrap() {
            let instance = group.instance.unwrap();
            assert_eq!(instance.state, ActualLrpState::Claimed);
            assert_eq!(instance.cell_id, "cell-a");
        }
    }

    #[tokio::test]
    async fn unknown_stack_records_cell_mismatch() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        directory.register(FakeCell::new("cell-a", &store, 4096)).await;
        register_presence(&store, "cell-a");
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), directory, config());

        let keys = store.desire_lrp(desired("web", "preloaded:no-such-stack", 1)).unwrap();
        let summary = auctioneer
            .run_batch(keys.into_iter().map(StartRequest::Lrp).collect())
            .await;
        assert_eq!(summary.failed, 1);

        let actual = store
            .actual_lrp_group_by_process_guid_and_index("web", 0)
            .unwrap()
            .instance
            .unwrap();
        assert_eq!(actual.state, ActualLrpState::Unclaimed);
        assert_eq!(actual.placement_error.as_deref(), Some("found no compatible cell"));
    }

    #[tokio::test]
    async fn missing_volume_driver_fails_task() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        directory.register(FakeCell::new("cell-a", &store, 4096)).await;
        register_presence(&store, "cell-a");
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), directory, config());

        store.desire_task(task("t1", 64, &["nfs", "ceph"])).unwrap();
        auctioneer.run_batch(vec![StartRequest::Task("t1".into())]).await;

        let t = store.task_by_guid("t1").unwrap();
        assert_eq!(t.state, TaskState::Completed);
        assert!(t.failed);
        assert_eq!(t.failure_reason, "found no compatible cell");
    }

    #[tokio::test]
    async fn oversized_task_stays_pending() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        directory.register(FakeCell::new("cell-a", &store, 256)).await;
        register_presence(&store, "cell-a");
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), directory, config());

        store.desire_task(task("big", 1024, &[])).unwrap();
        let summary = auctioneer.run_batch(vec![StartRequest::Task("big".into())]).await;
        assert_eq!(summary.deferred, 1);
        assert_eq!(store.task_by_guid("big").unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn removed_records_are_dropped() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        directory.register(FakeCell::new("cell-a", &store, 4096)).await;
        register_presence(&store, "cell-a");
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), directory, config());

        let keys = store.desire_lrp(desired("web", "preloaded:cflinuxfs", 1)).unwrap();
        store.remove_desired_lrp("web").unwrap();
        let summary = auctioneer
            .run_batch(keys.into_iter().map(StartRequest::Lrp).collect())
            .await;
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.placed, 0);
    }

    #[tokio::test]
    async fn hung_cell_work_moves_elsewhere() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        // `cell-a` wins ties but never answers.
        directory.register(FakeCell::hanging("cell-a", &store)).await;
        directory.register(FakeCell::new("cell-b", &store, 4096)).await;
        register_presence(&store, "cell-a");
        register_presence(&store, "cell-b");
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), directory, config());

        store.desire_task(task("t1", 64, &[])).unwrap();
        let summary = auctioneer.run_batch(vec![StartRequest::Task("t1".into())]).await;
        assert_eq!(summary.placed, 1);
        let t = store.task_by_guid("t1").unwrap();
        assert_eq!(t.state, TaskState::Running);
        assert_eq!(t.cell_id, "cell-b");
    }

    #[tokio::test]
    async fn no_live_cells_is_retryable() {
        let store = StateStore::open_in_memory().unwrap();
        let (auctioneer, _handle) = Auctioneer::new(store.clone(), CellDirectory::new(), config());

        let keys = store.desire_lrp(desired("web", "preloaded:cflinuxfs", 1)).unwrap();
        auctioneer
            .run_batch(keys.into_iter().map(StartRequest::Lrp).collect())
            .await;
        let actual = store.actual_lrp(&ActualLrpKey::new("web", 0)).unwrap().unwrap();
        assert_eq!(actual.placement_error.as_deref(), Some("insufficient resources"));
    }

    #[tokio::test]
    async fn run_loop_drains_handle() {
        let store = StateStore::open_in_memory().unwrap();
        let directory = CellDirectory::new();
        directory.register(FakeCell::new("cell-a", &store, 4096)).await;
        register_presence(&store, "cell-a");
        let (auctioneer, handle) = Auctioneer::new(store.clone(), directory, config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(auctioneer.run(shutdown_rx));

        store.desire_task(task("t1", 64, &[])).unwrap();
        handle.request_task_start("t1");
        handle.request_task_start("t1");

        let mut started = false;
        for _ in 0..100 {
            if store.task_by_guid("t1").unwrap().state == TaskState::Running {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(started);

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }
}
