//! Wiring of store, auctioneer, cells, converger and stager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cellgrid_api::{ApiState, build_router};
use cellgrid_converger::Converger;
use cellgrid_core::{CellConfig, GridConfig};
use cellgrid_placement::{Auctioneer, AuctioneerHandle, CellDirectory};
use cellgrid_rep::{ContainerRuntime, HttpTransfer, LocalRuntime, Rep, Transfer};
use cellgrid_stager::{MessageBus, Stager};
use cellgrid_state::{CrashPolicy, StateStore};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// What a cell runs containers with and fetches artifacts through.
pub type CellBackends = (Arc<dyn ContainerRuntime>, Arc<dyn Transfer>);

pub struct Grid {
    config: GridConfig,
    store: StateStore,
    cells: CellDirectory,
    bus: MessageBus,
    reps: Vec<Rep>,
    auctioneer: Auctioneer,
    handle: AuctioneerHandle,
}

impl Grid {
    /// Build the grid with a [`LocalRuntime`] under each cell's work
    /// directory and HTTP artifact transfer.
    pub async fn new(config: GridConfig) -> anyhow::Result<Self> {
        Self::with_backends(config, |cell| {
            let runtime = LocalRuntime::new(cell.work_dir.join(&cell.id))?;
            Ok((
                Arc::new(runtime) as Arc<dyn ContainerRuntime>,
                Arc::new(HttpTransfer::new(TRANSFER_TIMEOUT)) as Arc<dyn Transfer>,
            ))
        })
        .await
    }

    pub async fn with_backends<F>(config: GridConfig, mut backends: F) -> anyhow::Result<Self>
    where
        F: FnMut(&CellConfig) -> anyhow::Result<CellBackends>,
    {
        config.validate()?;

        let store = StateStore::from_config(&config.store)?
            .with_crash_policy(CrashPolicy::from(&config.crash_policy));
        match &config.store.path {
            Some(path) => info!(path = ?path, "state store opened"),
            None => info!("in-memory state store opened"),
        }

        let cells = CellDirectory::new();
        let (auctioneer, handle) =
            Auctioneer::new(store.clone(), cells.clone(), config.auctioneer.clone());

        let mut reps = Vec::with_capacity(config.cells.len());
        for cell in &config.cells {
            let (runtime, transfer) = backends(cell)?;
            let rep = Rep::new(cell.clone(), store.clone(), runtime, transfer);
            rep.set_auctioneer(handle.clone()).await;
            cells.register(Arc::new(rep.clone())).await;
            info!(cell_id = %cell.id, zone = %cell.zone, "cell initialized");
            reps.push(rep);
        }

        Ok(Self {
            config,
            store,
            cells,
            bus: MessageBus::default(),
            reps,
            auctioneer,
            handle,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn reps(&self) -> &[Rep] {
        &self.reps
    }

    pub fn router(&self) -> axum::Router {
        build_router(ApiState {
            store: self.store.clone(),
            cells: self.cells.clone(),
            auctioneer: self.handle.clone(),
        })
    }

    /// Run every background loop until `shutdown` flips, then evacuate the
    /// cells so their instances are handed back unclaimed.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let Grid {
            config,
            store,
            cells,
            bus,
            reps,
            auctioneer,
            handle,
        } = self;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(auctioneer.run(shutdown.clone())));

        for rep in &reps {
            let rep = rep.clone();
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { rep.run(rx).await }));
        }

        let converger = Converger::new(
            store.clone(),
            cells.clone(),
            handle.clone(),
            config.converger.clone(),
        );
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(async move { converger.run(rx).await }));

        if config.stager.enabled {
            let stager = Stager::new(store.clone(), bus.clone(), handle.clone(), config.stager);
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { stager.run(rx).await }));
        }

        info!(cells = reps.len(), "grid running");

        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        for rep in &reps {
            if let Err(e) = rep.evacuate().await {
                warn!(cell_id = %rep.config().id, error = %e, "evacuation failed");
            }
        }
        info!("grid stopped");
    }
}
