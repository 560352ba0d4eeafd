//! Scripted runtime and transfer fakes shared by the unit tests.
//!
//! Processes are interpreted by path:
//! - `true` / `false`: exit 0 / 1
//! - `exit N`: exit N
//! - `sleep SECS`: sleep, then exit 0
//! - `forever`: never exits
//! - `oom`: out-of-memory kill
//! - `check PATH`: exit 0 if PATH was streamed in, else 1
//! - `write PATH CONTENT`: create a file, exit 0

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use cellgrid_core::CellConfig;
use cellgrid_state::{Action, DesiredLrp, PortMapping, Resources, Task, TaskState};

use crate::error::{RepError, RepResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ProcessExit, ProcessSpec};
use crate::transfer::Transfer;

struct FakeContainer {
    spec: ContainerSpec,
    files: BTreeMap<String, Bytes>,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    runs: Mutex<Vec<(String, ProcessSpec)>>,
    fail_create: AtomicBool,
    create_gate: Mutex<Option<Arc<Notify>>>,
    list_gate: Mutex<Option<ListGate>>,
}

/// Pauses one `list` call after it has taken its snapshot.
#[derive(Clone, Default)]
pub struct ListGate {
    pub listed: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Make every `create` wait for a permit on the returned gate.
    pub fn hold_creates(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.create_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Pause the next `list` between its snapshot and its return.
    pub fn pause_next_list(&self) -> ListGate {
        let gate = ListGate::default();
        *self.list_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Delete a container behind the rep's back.
    pub fn vanish(&self, handle: &str) -> bool {
        self.containers.lock().unwrap().remove(handle).is_some()
    }

    pub fn spec(&self, handle: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .map(|c| c.spec.clone())
    }

    pub fn put_file(&self, handle: &str, path: &str, content: &'static [u8]) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(handle) {
            c.files.insert(path.to_string(), Bytes::from_static(content));
        }
    }

    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn runs(&self) -> Vec<(String, ProcessSpec)> {
        self.runs.lock().unwrap().clone()
    }

    fn has_file(&self, handle: &str, path: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .is_some_and(|c| c.files.contains_key(path))
    }

    fn ensure(&self, handle: &str) -> RepResult<()> {
        if self.containers.lock().unwrap().contains_key(handle) {
            Ok(())
        } else {
            Err(RepError::UnknownContainer(handle.to_string()))
        }
    }
}

fn exited(status: i32) -> RepResult<ProcessExit> {
    Ok(ProcessExit {
        status,
        oom_killed: false,
    })
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: ContainerSpec) -> RepResult<ContainerInfo> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RepError::Container("create refused".to_string()));
        }
        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.handle) {
            return Err(RepError::Container(format!("{} exists", spec.handle)));
        }
        let info = ContainerInfo {
            handle: spec.handle.clone(),
            address: "10.0.0.1".to_string(),
            ports: spec
                .ports
                .iter()
                .map(|&p| PortMapping {
                    container_port: p,
                    host_port: 60000 + p % 1000,
                })
                .collect(),
        };
        containers.insert(
            spec.handle.clone(),
            FakeContainer {
                spec,
                files: BTreeMap::new(),
            },
        );
        Ok(info)
    }

    async fn run(&self, handle: &str, process: ProcessSpec) -> RepResult<ProcessExit> {
        self.ensure(handle)?;
        self.runs
            .lock()
            .unwrap()
            .push((handle.to_string(), process.clone()));
        let arg = |i: usize| process.args.get(i).cloned().unwrap_or_default();
        match process.path.as_str() {
            "true" => exited(0),
            "false" => exited(1),
            "exit" => exited(arg(0).parse().unwrap_or(1)),
            "sleep" => {
                let secs: f64 = arg(0).parse().unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                exited(0)
            }
            "forever" => std::future::pending().await,
            "oom" => Ok(ProcessExit {
                status: 137,
                oom_killed: true,
            }),
            "check" => exited(if self.has_file(handle, &arg(0)) { 0 } else { 1 }),
            "write" => {
                if let Some(c) = self.containers.lock().unwrap().get_mut(handle) {
                    c.files.insert(arg(0), Bytes::from(arg(1)));
                }
                exited(0)
            }
            other => Err(RepError::Container(format!("no such program {other}"))),
        }
    }

    async fn destroy(&self, handle: &str) -> RepResult<()> {
        self.containers.lock().unwrap().remove(handle);
        Ok(())
    }

    async fn properties(&self, handle: &str) -> RepResult<BTreeMap<String, String>> {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .map(|c| c.spec.properties.clone())
            .ok_or_else(|| RepError::UnknownContainer(handle.to_string()))
    }

    async fn stream_in(&self, handle: &str, destination: &str, content: Bytes) -> RepResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(handle)
            .ok_or_else(|| RepError::UnknownContainer(handle.to_string()))?;
        c.files.insert(destination.to_string(), content);
        Ok(())
    }

    async fn stream_out(&self, handle: &str, source: &str) -> RepResult<Bytes> {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .ok_or_else(|| RepError::UnknownContainer(handle.to_string()))?
            .files
            .get(source)
            .cloned()
            .ok_or_else(|| RepError::Container(format!("{source} not found")))
    }

    async fn list(&self) -> RepResult<Vec<String>> {
        let handles = self.handles();
        let gate = self.list_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.listed.notify_one();
            gate.release.notified().await;
        }
        Ok(handles)
    }
}

#[derive(Default)]
pub struct FakeTransfer {
    artifacts: Mutex<HashMap<String, Bytes>>,
    uploads: Mutex<Vec<(String, Bytes)>>,
    downloads: AtomicUsize,
}

impl FakeTransfer {
    pub fn with_artifact(self, url: &str, content: &'static [u8]) -> Self {
        self.artifacts
            .lock()
            .unwrap()
            .insert(url.to_string(), Bytes::from_static(content));
        self
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<(String, Bytes)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn download(&self, url: &str) -> RepResult<Bytes> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.artifacts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RepError::Transfer(format!("{url}: status 404 Not Found")))
    }

    async fn upload(&self, url: &str, body: Bytes) -> RepResult<()> {
        self.uploads.lock().unwrap().push((url.to_string(), body));
        Ok(())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────

pub fn cell_config(id: &str, memory_mb: u64) -> CellConfig {
    CellConfig {
        id: id.to_string(),
        memory_mb,
        disk_mb: memory_mb,
        containers: 10,
        heartbeat_interval: Duration::from_millis(20),
        polling_interval: Duration::from_millis(20),
        evacuation_timeout: Duration::from_millis(300),
        probe_interval: Duration::from_millis(10),
        healthy_probe_interval: Duration::from_millis(20),
        ..CellConfig::default()
    }
}

pub fn desired_lrp(guid: &str, instances: u32, action: Action) -> DesiredLrp {
    DesiredLrp {
        process_guid: guid.to_string(),
        domain: "apps".to_string(),
        instances,
        rootfs: "preloaded:cflinuxfs".to_string(),
        setup: None,
        action,
        monitor: None,
        start_timeout_ms: 0,
        resources: Resources {
            memory_mb: 64,
            disk_mb: 64,
            max_pids: 0,
        },
        privileged: false,
        volume_mounts: vec![],
        egress_rules: vec![],
        ports: vec![8080],
        routes: vec![],
        cached_dependencies: vec![],
        properties: Default::default(),
        annotation: String::new(),
        created_at: 0,
        updated_at: 0,
        modification_index: 0,
    }
}

pub fn task(guid: &str, action: Action) -> Task {
    Task {
        task_guid: guid.to_string(),
        domain: "tasks".to_string(),
        rootfs: "preloaded:cflinuxfs".to_string(),
        action,
        resources: Resources {
            memory_mb: 32,
            disk_mb: 32,
            max_pids: 0,
        },
        volume_mounts: vec![],
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

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
