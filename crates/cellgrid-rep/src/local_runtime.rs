//! Directory-backed container runtime.
//!
//! A container is a directory under the runtime root holding a
//! `container.json` manifest. Processes run as host processes in their own
//! process group with the container directory as `HOME`; absolute paths in
//! actions resolve inside the container directory when they exist there.
//!
//! Limits:
//! - `nofile` is applied with `setrlimit` before exec.
//! - Memory is enforced by sampling the process group's resident set every
//!   [`MEMORY_POLL`]; a group over its ceiling is killed and reported as
//!   out of memory. The sampling only works on Linux.
//! - Disk is checked after every `stream_in`.
//! - `max_pids` becomes `RLIMIT_NPROC`. The kernel counts that limit per
//!   user rather than per container, and root is exempt from it.
//!
//! Volumes live under `volumes/` in the runtime root, one directory per
//! volume id, and are linked into each mounting container at its
//! `container_path`, so processes find them under `$HOME<container_path>`.
//! Read-only mounts are not enforced.
//!
//! Egress rules are enforced by a per-container [`EgressProxy`] that every
//! process is pointed at through the proxy variables. Only clients that
//! honor those variables are filtered; downloads the rep performs itself
//! are not subject to the rules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use cellgrid_state::PortMapping;

use crate::egress::{EgressProxy, NO_PROXY, PROXY_VARS};
use crate::error::{RepError, RepResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ProcessExit, ProcessSpec};

const MANIFEST: &str = "container.json";
const VOLUMES: &str = "volumes";
const MEMORY_POLL: Duration = Duration::from_millis(100);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    spec: ContainerSpec,
    info: ContainerInfo,
}

struct Container {
    dir: PathBuf,
    manifest: Manifest,
    /// Process groups currently running in the container.
    groups: Mutex<HashSet<i32>>,
    /// Started by the first process.
    egress: OnceCell<EgressProxy>,
}

impl Container {
    fn new(dir: PathBuf, manifest: Manifest) -> Self {
        Self {
            dir,
            manifest,
            groups: Mutex::new(HashSet::new()),
            egress: OnceCell::new(),
        }
    }

    fn kill_all(&self) {
        let groups: Vec<i32> = match self.groups.lock() {
            Ok(groups) => groups.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        };
        for pgid in groups {
            kill_group(pgid);
        }
    }

    fn track(&self, pgid: i32, running: bool) {
        let mut groups = match self.groups.lock() {
            Ok(groups) => groups,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running {
            groups.insert(pgid);
        } else {
            groups.remove(&pgid);
        }
    }
}

pub struct LocalRuntime {
    root: PathBuf,
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl LocalRuntime {
    /// Open the runtime rooted at `root`, adopting containers left behind by
    /// a previous run so reconciliation can clean them up.
    pub fn new(root: impl Into<PathBuf>) -> RepResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut containers = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let dir = entry?.path();
            let Ok(raw) = std::fs::read(dir.join(MANIFEST)) else {
                continue;
            };
            match serde_json::from_slice::<Manifest>(&raw) {
                Ok(manifest) => {
                    containers.insert(
                        manifest.spec.handle.clone(),
                        Arc::new(Container::new(dir, manifest)),
                    );
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "unreadable container manifest"),
            }
        }
        if !containers.is_empty() {
            info!(root = %root.display(), adopted = containers.len(), "adopted existing containers");
        }

        Ok(Self {
            root,
            containers: RwLock::new(containers),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing `handle`, whether or not it exists yet.
    pub fn container_dir(&self, handle: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(handle.as_bytes()));
        self.root.join(&digest[..16])
    }

    /// Host directory shared by every mount of `volume_id`.
    pub fn volume_dir(&self, volume_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(volume_id.as_bytes()));
        self.root.join(VOLUMES).join(&digest[..16])
    }

    async fn mount_volumes(&self, dir: &Path, spec: &ContainerSpec) -> RepResult<()> {
        for mount in &spec.volume_mounts {
            let target = resolve_in(dir, &mount.container_path)
                .filter(|target| target != dir)
                .ok_or_else(|| {
                    RepError::Container(format!("invalid mount path {}", mount.container_path))
                })?;
            let source = self.volume_dir(&mount.volume_id);
            tokio::fs::create_dir_all(&source).await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::symlink(&source, &target).await?;
            debug!(
                handle = %spec.handle,
                volume_id = %mount.volume_id,
                container_path = %mount.container_path,
                "volume mounted"
            );
        }
        Ok(())
    }

    async fn container(&self, handle: &str) -> RepResult<Arc<Container>> {
        let container = self
            .containers
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| RepError::UnknownContainer(handle.to_string()))?;
        // Deleted out from under us.
        if !container.dir.exists() {
            return Err(RepError::UnknownContainer(handle.to_string()));
        }
        Ok(container)
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn create(&self, spec: ContainerSpec) -> RepResult<ContainerInfo> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(&spec.handle) {
            return Err(RepError::Container(format!(
                "container {} already exists",
                spec.handle
            )));
        }

        let dir = self.container_dir(&spec.handle);
        tokio::fs::create_dir_all(&dir).await?;
        if let Err(e) = self.mount_volumes(&dir, &spec).await {
            // Links only; removing them leaves the volumes alone.
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        let mut ports = Vec::with_capacity(spec.ports.len());
        for &container_port in &spec.ports {
            ports.push(PortMapping {
                container_port,
                host_port: free_port()?,
            });
        }
        let info = ContainerInfo {
            handle: spec.handle.clone(),
            address: "127.0.0.1".to_string(),
            ports,
        };
        let manifest = Manifest {
            spec,
            info: info.clone(),
        };
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| RepError::Container(e.to_string()))?;
        tokio::fs::write(dir.join(MANIFEST), raw).await?;

        debug!(handle = %info.handle, dir = %dir.display(), "container created");
        containers.insert(info.handle.clone(), Arc::new(Container::new(dir, manifest)));
        Ok(info)
    }

    async fn run(&self, handle: &str, process: ProcessSpec) -> RepResult<ProcessExit> {
        let container = self.container(handle).await?;
        let spec = &container.manifest.spec;

        let program = resolve_in(&container.dir, &process.path)
            .filter(|p| p.exists())
            .map(|p| p.into_os_string())
            .unwrap_or_else(|| process.path.clone().into());
        let cwd = match &process.dir {
            Some(dir) => resolve_in(&container.dir, dir).unwrap_or_else(|| container.dir.clone()),
            None => container.dir.clone(),
        };
        tokio::fs::create_dir_all(&cwd).await?;

        let mut cmd = Command::new(program);
        cmd.args(&process.args)
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", &container.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &spec.env {
            cmd.env(&var.name, &var.value);
        }
        // No port translation here: the process listens on the host port.
        if let Some(mapping) = container.manifest.info.ports.first() {
            cmd.env("PORT", mapping.host_port.to_string());
        }
        for var in &process.env {
            cmd.env(&var.name, &var.value);
        }
        let proxy = container
            .egress
            .get_or_try_init(|| EgressProxy::start(handle, spec.egress_rules.clone()))
            .await?;
        let proxy_url = proxy.url();
        for name in PROXY_VARS {
            cmd.env(name, &proxy_url);
        }
        cmd.env("NO_PROXY", NO_PROXY).env("no_proxy", NO_PROXY);
        if let Some(user) = &process.user {
            debug!(%handle, %user, "local runtime runs processes as the daemon user");
        }

        let nofile = process.limits.nofile;
        let max_pids = spec.resources.max_pids;
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(n) = nofile {
                    let limit = libc::rlimit {
                        rlim_cur: n as libc::rlim_t,
                        rlim_max: n as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if max_pids > 0 {
                    let mut current = libc::rlimit {
                        rlim_cur: 0,
                        rlim_max: 0,
                    };
                    if libc::getrlimit(libc::RLIMIT_NPROC, &mut current) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let n = (max_pids as libc::rlim_t).min(current.rlim_max);
                    let limit = libc::rlimit {
                        rlim_cur: n,
                        rlim_max: n,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RepError::Container(format!("failed to start {}: {e}", process.path)))?;
        let pgid = child.id().map(|id| id as i32).unwrap_or_default();
        container.track(pgid, true);
        let _guard = GroupGuard {
            container: container.clone(),
            pgid,
        };

        forward_output(handle, "stdout", child.stdout.take());
        forward_output(handle, "stderr", child.stderr.take());

        let ceiling = spec.resources.memory_mb.saturating_mul(1024 * 1024);
        let mut oom_killed = false;
        let mut poll = tokio::time::interval(MEMORY_POLL);
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = poll.tick(), if ceiling > 0 && !oom_killed => {
                    if group_rss_bytes(pgid).is_some_and(|rss| rss > ceiling) {
                        warn!(%handle, memory_mb = spec.resources.memory_mb, "memory limit exceeded, killing");
                        oom_killed = true;
                        kill_group(pgid);
                    }
                }
            }
        };

        Ok(ProcessExit {
            status: exit_code(&status),
            oom_killed,
        })
    }

    async fn destroy(&self, handle: &str) -> RepResult<()> {
        let Some(container) = self.containers.write().await.remove(handle) else {
            return Ok(());
        };
        container.kill_all();
        match tokio::fs::remove_dir_all(&container.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(%handle, "container destroyed");
        Ok(())
    }

    async fn properties(&self, handle: &str) -> RepResult<BTreeMap<String, String>> {
        Ok(self.container(handle).await?.manifest.spec.properties.clone())
    }

    async fn stream_in(&self, handle: &str, destination: &str, content: Bytes) -> RepResult<()> {
        let container = self.container(handle).await?;
        let target = resolve_in(&container.dir, destination)
            .ok_or_else(|| RepError::Container(format!("invalid path {destination}")))?;
        let dir = container.dir.clone();
        let disk_mb = container.manifest.spec.resources.disk_mb;

        tokio::task::spawn_blocking(move || -> RepResult<()> {
            if content.starts_with(&GZIP_MAGIC) {
                std::fs::create_dir_all(&target)?;
                let decoder = flate2::read::GzDecoder::new(content.as_ref());
                tar::Archive::new(decoder).unpack(&target)?;
            } else if is_tar(&content) {
                std::fs::create_dir_all(&target)?;
                tar::Archive::new(content.as_ref()).unpack(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, &content)?;
            }
            if disk_mb > 0 && disk_usage(&dir) > disk_mb.saturating_mul(1024 * 1024) {
                return Err(RepError::Container("disk limit exceeded".to_string()));
            }
            Ok(())
        })
        .await
        .map_err(|e| RepError::Container(e.to_string()))?
    }

    async fn stream_out(&self, handle: &str, source: &str) -> RepResult<Bytes> {
        let container = self.container(handle).await?;
        let path = resolve_in(&container.dir, source)
            .ok_or_else(|| RepError::Container(format!("invalid path {source}")))?;

        tokio::task::spawn_blocking(move || -> RepResult<Bytes> {
            if path.is_dir() {
                let encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                let mut builder = tar::Builder::new(encoder);
                for entry in walkdir::WalkDir::new(&path).min_depth(1) {
                    let entry = entry.map_err(|e| RepError::Container(e.to_string()))?;
                    let Ok(relative) = entry.path().strip_prefix(&path) else {
                        continue;
                    };
                    if entry.file_type().is_dir() {
                        builder.append_dir(relative, entry.path())?;
                    } else if entry.file_type().is_file() {
                        builder.append_path_with_name(entry.path(), relative)?;
                    }
                }
                let encoder = builder.into_inner()?;
                Ok(Bytes::from(encoder.finish()?))
            } else {
                let mut raw = Vec::new();
                std::fs::File::open(&path)?.read_to_end(&mut raw)?;
                Ok(Bytes::from(raw))
            }
        })
        .await
        .map_err(|e| RepError::Container(e.to_string()))?
    }

    async fn list(&self) -> RepResult<Vec<String>> {
        let containers = self.containers.read().await;
        let mut handles: Vec<String> = containers
            .iter()
            .filter(|(_, c)| c.dir.exists())
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }
}

/// Kills the process group when `run` finishes or is dropped.
struct GroupGuard {
    container: Arc<Container>,
    pgid: i32,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.pgid);
        self.container.track(self.pgid, false);
    }
}

fn kill_group(pgid: i32) {
    if pgid > 0 {
        // SAFETY: plain syscall; a group that already exited yields ESRCH.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

fn forward_output<R>(handle: &str, stream: &'static str, reader: Option<R>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return;
    };
    let handle = handle.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%handle, stream, "{line}");
        }
    });
}

/// Map a container path onto the container directory. Rejects `..`.
fn resolve_in(root: &Path, path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn is_tar(content: &[u8]) -> bool {
    content.len() > 262 && &content[257..262] == b"ustar"
}

fn disk_usage(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

fn free_port() -> RepResult<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Resident set size of every process in `pgid`.
#[cfg(target_os = "linux")]
fn group_rss_bytes(pgid: i32) -> Option<u64> {
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    let mut pages = 0u64;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((group, rss)) = parse_stat(&stat) {
            if group == pgid {
                pages += rss;
            }
        }
    }
    Some(pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn group_rss_bytes(_pgid: i32) -> Option<u64> {
    None
}

/// `(pgrp, rss pages)` from a `/proc/<pid>/stat` line.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(i32, u64)> {
    // The command name may contain spaces; fields resume after its ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}
