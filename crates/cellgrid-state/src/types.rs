//! Records persisted by the CellGrid state store.
//!
//! Every record is JSON-serialized into a redb table and carries a
//! `modification_index` that the store bumps on each write. Timestamps are
//! Unix epoch milliseconds.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Records the store versions on every write.
pub trait Versioned {
    fn modification_index(&self) -> u64;
    fn set_modification_index(&mut self, index: u64);
}

macro_rules! versioned {
    ($($ty:ty),*) => {
        $(impl Versioned for $ty {
            fn modification_index(&self) -> u64 {
                self.modification_index
            }
            fn set_modification_index(&mut self, index: u64) {
                self.modification_index = index;
            }
        })*
    };
}

versioned!(DesiredLrp, ActualLrp, Task, CellPresence);

// ── Shared pieces ──────────────────────────────────────────────────

/// Resources reserved on a cell for one container.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Resources {
    pub memory_mb: u64,
    pub disk_mb: u64,
    /// Zero means unlimited.
    pub max_pids: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub driver: String,
    pub volume_id: String,
    pub container_path: String,
    #[serde(default)]
    pub mode: MountMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// One security group rule; see [`crate::egress`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EgressRule {
    /// `tcp`, `udp`, `icmp` or `all`.
    pub protocol: String,
    pub destinations: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
}

/// An artifact fetched into the container before the setup action runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedDependency {
    #[serde(default)]
    pub name: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub cache_key: Option<String>,
}

/// Hostnames routed to one container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub port: u16,
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    pub nofile: Option<u64>,
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootFs {
    /// `preloaded:<stack>`, provided by the cell itself.
    Preloaded(String),
    /// `<scheme>://<path>`, fetched by a provider such as `docker`.
    Provider { scheme: String, path: String },
}

impl RootFs {
    pub fn parse(raw: &str) -> StateResult<Self> {
        if let Some(stack) = raw.strip_prefix("preloaded:") {
            if stack.is_empty() {
                return Err(StateError::Invalid(format!("empty preloaded rootfs: {raw}")));
            }
            return Ok(RootFs::Preloaded(stack.to_string()));
        }
        match raw.split_once("://") {
            Some((scheme, path)) if !scheme.is_empty() => Ok(RootFs::Provider {
                scheme: scheme.to_string(),
                path: path.to_string(),
            }),
            _ => Err(StateError::Invalid(format!("invalid rootfs: {raw:?}"))),
        }
    }
}

// ── Actions ────────────────────────────────────────────────────────

/// The action graph a cell executes inside a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Run {
        path: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<EnvVar>,
        #[serde(default)]
        dir: Option<String>,
        #[serde(default)]
        user: String,
        #[serde(default)]
        resource_limits: ResourceLimits,
    },
    Download {
        from: String,
        to: String,
        #[serde(default)]
        cache_key: Option<String>,
        #[serde(default)]
        user: String,
    },
    Upload {
        from: String,
        to: String,
        #[serde(default)]
        user: String,
    },
    Timeout {
        action: Box<Action>,
        timeout_ms: u64,
    },
    Serial {
        actions: Vec<Action>,
    },
    Parallel {
        actions: Vec<Action>,
    },
    Try {
        action: Box<Action>,
    },
    EmitProgress {
        action: Box<Action>,
        #[serde(default)]
        start_message: String,
        #[serde(default)]
        success_message: String,
        #[serde(default)]
        failure_prefix: String,
    },
}

impl Action {
    /// Shorthand for a `Run` action with no environment or limits.
    pub fn run(path: impl Into<String>, args: &[&str]) -> Self {
        Action::Run {
            path: path.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            dir: None,
            user: String::new(),
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn timeout(action: Action, timeout_ms: u64) -> Self {
        Action::Timeout {
            action: Box::new(action),
            timeout_ms,
        }
    }
}

// ── Desired LRP ────────────────────────────────────────────────────

/// A long-running process the operator wants `instances` copies of.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredLrp {
    pub process_guid: String,
    pub domain: String,
    pub instances: u32,
    pub rootfs: String,
    #[serde(default)]
    pub setup: Option<Action>,
    pub action: Action,
    #[serde(default)]
    pub monitor: Option<Action>,
    #[serde(default)]
    pub start_timeout_ms: u64,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub egress_rules: Vec<EgressRule>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub cached_dependencies: Vec<CachedDependency>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub modification_index: u64,
}

impl DesiredLrp {
    pub fn validate(&self) -> StateResult<()> {
        if self.process_guid.is_empty() {
            return Err(StateError::Invalid("process_guid is required".to_string()));
        }
        if self.process_guid.contains(':') {
            return Err(StateError::Invalid(format!(
                "process_guid must not contain ':': {}",
                self.process_guid
            )));
        }
        if self.domain.is_empty() {
            return Err(StateError::Invalid("domain is required".to_string()));
        }
        RootFs::parse(&self.rootfs)?;
        for rule in &self.egress_rules {
            rule.validate()?;
        }
        Ok(())
    }

    pub fn volume_drivers(&self) -> Vec<String> {
        self.volume_mounts.iter().map(|m| m.driver.clone()).collect()
    }
}

/// The fields of a desired LRP that may change after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DesiredLrpUpdate {
    pub instances: Option<u32>,
    pub routes: Option<Vec<Route>>,
    pub annotation: Option<String>,
}

// ── Actual LRP ─────────────────────────────────────────────────────

/// Identifies one instance slot of a desired LRP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActualLrpKey {
    pub process_guid: String,
    pub index: u32,
}

impl ActualLrpKey {
    pub fn new(process_guid: impl Into<String>, index: u32) -> Self {
        Self {
            process_guid: process_guid.into(),
            index,
        }
    }

    /// Composite key for the actual LRPs table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.process_guid, self.index)
    }
}

impl fmt::Display for ActualLrpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process_guid, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualLrpState {
    Unclaimed,
    Claimed,
    Running,
    Crashed,
}

impl fmt::Display for ActualLrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActualLrpState::Unclaimed => "UNCLAIMED",
            ActualLrpState::Claimed => "CLAIMED",
            ActualLrpState::Running => "RUNNING",
            ActualLrpState::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetInfo {
    pub address: String,
    pub ports: Vec<PortMapping>,
}

/// One running (or about to run) copy of a desired LRP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActualLrp {
    pub process_guid: String,
    pub index: u32,
    pub domain: String,
    #[serde(default)]
    pub instance_guid: String,
    #[serde(default)]
    pub cell_id: String,
    pub state: ActualLrpState,
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default)]
    pub crash_reason: Option<String>,
    #[serde(default)]
    pub placement_error: Option<String>,
    #[serde(default)]
    pub net_info: Option<NetInfo>,
    /// Time of the last state change.
    pub since: u64,
    #[serde(default)]
    pub modification_index: u64,
}

impl ActualLrp {
    pub fn unclaimed(key: &ActualLrpKey, domain: &str, now: u64) -> Self {
        Self {
            process_guid: key.process_guid.clone(),
            index: key.index,
            domain: domain.to_string(),
            instance_guid: String::new(),
            cell_id: String::new(),
            state: ActualLrpState::Unclaimed,
            crash_count: 0,
            crash_reason: None,
            placement_error: None,
            net_info: None,
            since: now,
            modification_index: 0,
        }
    }

    pub fn key(&self) -> ActualLrpKey {
        ActualLrpKey::new(self.process_guid.clone(), self.index)
    }

    /// Claimed and Running instances are owned by a cell.
    pub fn is_owned(&self) -> bool {
        matches!(self.state, ActualLrpState::Claimed | ActualLrpState::Running)
    }

    pub fn owned_by(&self, instance_guid: &str, cell_id: &str) -> bool {
        self.is_owned() && self.instance_guid == instance_guid && self.cell_id == cell_id
    }

    /// Handle of the container backing this instance.
    pub fn container_handle(&self) -> String {
        lrp_container_handle(&self.process_guid, &self.instance_guid)
    }
}

pub fn lrp_container_handle(process_guid: &str, instance_guid: &str) -> String {
    format!("{process_guid}-{instance_guid}")
}

/// API read shape for one instance index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActualLrpGroup {
    pub instance: Option<ActualLrp>,
    /// Evacuation hands instances back without a second record, so this
    /// stays empty.
    pub evacuating: Option<ActualLrp>,
}

// ── Task ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Resolving,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Resolving => "RESOLVING",
        };
        f.write_str(s)
    }
}

/// A one-off unit of work run to completion on a single cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_guid: String,
    pub domain: String,
    pub rootfs: String,
    pub action: Action,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub egress_rules: Vec<EgressRule>,
    #[serde(default)]
    pub privileged: bool,
    /// Path inside the container read back into `result` on success.
    #[serde(default)]
    pub result_file: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub cached_dependencies: Vec<CachedDependency>,
    #[serde(default)]
    pub annotation: String,
    #[serde(default = "TaskState::pending")]
    pub state: TaskState,
    #[serde(default)]
    pub cell_id: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub first_completed_at: Option<u64>,
    #[serde(default)]
    pub modification_index: u64,
}

impl TaskState {
    fn pending() -> Self {
        TaskState::Pending
    }
}

impl Task {
    pub fn validate(&self) -> StateResult<()> {
        if self.task_guid.is_empty() {
            return Err(StateError::Invalid("task_guid is required".to_string()));
        }
        if self.domain.is_empty() {
            return Err(StateError::Invalid("domain is required".to_string()));
        }
        RootFs::parse(&self.rootfs)?;
        for rule in &self.egress_rules {
            rule.validate()?;
        }
        Ok(())
    }

    pub fn volume_drivers(&self) -> Vec<String> {
        self.volume_mounts.iter().map(|m| m.driver.clone()).collect()
    }
}

// ── Cell presence ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellCapacity {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u32,
}

/// A cell's lease in the store. Expired or missing means the cell is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellPresence {
    pub cell_id: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub rep_address: String,
    pub capacity: CellCapacity,
    #[serde(default)]
    pub stacks: Vec<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub volume_drivers: Vec<String>,
    #[serde(default)]
    pub allows_privileged: bool,
    pub expires_at: u64,
    #[serde(default)]
    pub modification_index: u64,
}

impl CellPresence {
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rootfs_parses_preloaded_and_schemes() {
        assert_eq!(
            RootFs::parse("preloaded:cflinuxfs").unwrap(),
            RootFs::Preloaded("cflinuxfs".to_string())
        );
        assert_eq!(
            RootFs::parse("docker:///busybox").unwrap(),
            RootFs::Provider {
                scheme: "docker".to_string(),
                path: "/busybox".to_string()
            }
        );
        assert!(RootFs::parse("busybox").is_err());
        assert!(RootFs::parse("preloaded:").is_err());
    }

    #[test]
    fn action_json_is_tagged() {
        let action = Action::timeout(Action::run("sleep", &["1"]), 500);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "timeout");
        assert_eq!(json["action"]["type"], "run");
        assert_eq!(json["action"]["args"][0], "1");

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn task_state_defaults_to_pending() {
        let task: Task = serde_json::from_str(
            r#"{"task_guid":"t","domain":"d","rootfs":"preloaded:cflinuxfs",
                "action":{"type":"run","path":"true"}}"#,
        )
        .unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.result_file.is_none());
    }

    #[test]
    fn container_handle_joins_guids() {
        assert_eq!(lrp_container_handle("web", "abc"), "web-abc");
    }

    #[test]
    fn process_guid_with_colon_rejected() {
        let lrp: DesiredLrp = serde_json::from_str(
            r#"{"process_guid":"a:b","domain":"d","instances":1,
                "rootfs":"preloaded:cflinuxfs","action":{"type":"run","path":"true"}}"#,
        )
        .unwrap();
        assert!(matches!(lrp.validate(), Err(StateError::Invalid(_))));
    }
}
