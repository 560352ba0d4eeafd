//! cellgrid.toml configuration parser.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub auctioneer: AuctioneerConfig,
    pub converger: ConvergerConfig,
    pub crash_policy: CrashPolicyConfig,
    pub stager: StagerConfig,
    pub cells: Vec<CellConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb file. `None` keeps state in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctioneerConfig {
    /// How long to collect requests before running a batch.
    #[serde(with = "serde_str")]
    pub batch_window: Duration,
    /// Deadline for fetching a cell's state.
    #[serde(with = "serde_str")]
    pub cell_state_timeout: Duration,
    /// Deadline for handing work to a cell.
    #[serde(with = "serde_str")]
    pub perform_timeout: Duration,
    /// Re-auction attempts for work a cell rejected or never acknowledged.
    pub max_retries: u32,
    pub starting_container_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergerConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Extra time after a cell lease expires before its work is reclaimed.
    #[serde(with = "serde_str")]
    pub cell_grace: Duration,
    #[serde(with = "serde_str")]
    pub retry_unplaced_after: Duration,
    #[serde(with = "serde_str")]
    pub expire_pending_task_after: Duration,
    #[serde(with = "serde_str")]
    pub expire_completed_task_after: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashPolicyConfig {
    pub immediate_restarts: u32,
    #[serde(with = "serde_str")]
    pub base_backoff: Duration,
    #[serde(with = "serde_str")]
    pub max_backoff: Duration,
    pub max_restart_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagerConfig {
    pub enabled: bool,
    /// Subjects are `<topic>.start` and `<topic>.finished`.
    pub topic: String,
    /// Stack name to the URL of its compiler lifecycle.
    pub compilers: BTreeMap<String, String>,
    pub min_memory_mb: u64,
    pub min_disk_mb: u64,
    pub min_file_descriptors: u64,
    /// Droplets are uploaded to `<droplet_upload_base>/<app_id>`.
    pub droplet_upload_base: String,
}

/// One in-process cell run by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    pub id: String,
    pub zone: String,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u32,
    /// Preloaded rootfs names, e.g. `cflinuxfs`.
    pub stacks: Vec<String>,
    /// Arbitrary rootfs schemes the cell can fetch, e.g. `docker`.
    pub providers: Vec<String>,
    pub volume_drivers: Vec<String>,
    pub allows_privileged: bool,
    #[serde(with = "serde_str")]
    pub presence_ttl: Duration,
    #[serde(with = "serde_str")]
    pub heartbeat_interval: Duration,
    #[serde(with = "serde_str")]
    pub polling_interval: Duration,
    #[serde(with = "serde_str")]
    pub evacuation_timeout: Duration,
    /// Monitor interval while an instance has not yet passed its probe.
    #[serde(with = "serde_str")]
    pub probe_interval: Duration,
    /// Monitor interval once an instance is healthy.
    #[serde(with = "serde_str")]
    pub healthy_probe_interval: Duration,
    /// Parent directory for container working directories.
    pub work_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("/var/lib/cellgrid/state.redb")),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8889)),
        }
    }
}

impl Default for AuctioneerConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            cell_state_timeout: Duration::from_secs(1),
            perform_timeout: Duration::from_secs(5),
            max_retries: 3,
            starting_container_weight: 0.33,
        }
    }
}

impl Default for ConvergerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            cell_grace: Duration::from_secs(10),
            retry_unplaced_after: Duration::from_secs(5),
            expire_pending_task_after: Duration::from_secs(30 * 60),
            expire_completed_task_after: Duration::from_secs(120),
        }
    }
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "diego.staging".to_string(),
            compilers: BTreeMap::new(),
            min_memory_mb: 256,
            min_disk_mb: 1024,
            min_file_descriptors: 256,
            droplet_upload_base: String::new(),
        }
    }
}

impl Default for CrashPolicyConfig {
    fn default() -> Self {
        Self {
            immediate_restarts: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(16 * 60),
            max_restart_attempts: 200,
        }
    }
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            id: "cell-0".to_string(),
            zone: "z1".to_string(),
            memory_mb: 1024,
            disk_mb: 4096,
            containers: 256,
            stacks: vec!["cflinuxfs".to_string()],
            providers: vec!["docker".to_string()],
            volume_drivers: Vec::new(),
            allows_privileged: false,
            presence_ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            polling_interval: Duration::from_secs(1),
            evacuation_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(500),
            healthy_probe_interval: Duration::from_secs(30),
            work_dir: PathBuf::from("/var/lib/cellgrid/cells"),
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for cell in &self.cells {
            if cell.id.is_empty() {
                anyhow::bail!("cell id must not be empty");
            }
            if !seen.insert(cell.id.as_str()) {
                anyhow::bail!("duplicate cell id: {}", cell.id);
            }
            if cell.heartbeat_interval >= cell.presence_ttl {
                anyhow::bail!(
                    "cell {}: heartbeat interval must be shorter than the presence ttl",
                    cell.id
                );
            }
        }
        if self.converger.interval.is_zero() {
            anyhow::bail!("converger interval must be non-zero");
        }
        Ok(())
    }

    /// A single-cell configuration with everything in memory.
    pub fn standalone() -> Self {
        Self {
            store: StoreConfig { path: None },
            cells: vec![CellConfig::default()],
            ..Self::default()
        }
    }
}
