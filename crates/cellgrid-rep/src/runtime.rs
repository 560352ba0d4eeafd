//! Container runtime interface.
//!
//! The rep only talks to containers through [`ContainerRuntime`]. The
//! daemon plugs in [`LocalRuntime`](crate::local_runtime::LocalRuntime);
//! tests use a scripted fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cellgrid_state::{EgressRule, EnvVar, PortMapping, ResourceLimits, Resources, VolumeMount};

use crate::error::{RepError, RepResult};

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub handle: String,
    pub rootfs: String,
    pub resources: Resources,
    #[serde(default)]
    pub privileged: bool,
    /// Environment every process in the container starts with.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Outbound traffic the container may open. Empty denies everything.
    #[serde(default)]
    pub egress_rules: Vec<EgressRule>,
    /// Container ports to expose.
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// What a created container looks like from outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub handle: String,
    pub address: String,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub dir: Option<String>,
    pub user: Option<String>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: i32,
    /// The container's memory ceiling was hit.
    pub oom_killed: bool,
}

impl ProcessExit {
    pub fn into_result(self) -> RepResult<()> {
        if self.status == 0 && !self.oom_killed {
            Ok(())
        } else {
            Err(RepError::exit(self.status, self.oom_killed))
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: ContainerSpec) -> RepResult<ContainerInfo>;

    /// Run a process to completion. Dropping the future kills the process.
    async fn run(&self, handle: &str, process: ProcessSpec) -> RepResult<ProcessExit>;

    /// Kill everything in the container and remove it. Unknown handles are
    /// not an error.
    async fn destroy(&self, handle: &str) -> RepResult<()>;

    async fn properties(&self, handle: &str) -> RepResult<BTreeMap<String, String>>;

    /// Place `content` at `destination`. Gzipped or plain tar archives are
    /// unpacked into the destination directory; anything else is written as
    /// a single file.
    async fn stream_in(&self, handle: &str, destination: &str, content: Bytes) -> RepResult<()>;

    /// Read `source` back out. A directory comes out as a gzipped tar.
    async fn stream_out(&self, handle: &str, source: &str) -> RepResult<Bytes>;

    /// Handles of every container the runtime knows about.
    async fn list(&self) -> RepResult<Vec<String>>;
}
