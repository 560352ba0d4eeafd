//! Action execution inside a container.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use tracing::{debug, info, warn};

use cellgrid_core::format_duration;
use cellgrid_state::{Action, CachedDependency, EnvVar};

use crate::error::{RepError, RepResult};
use crate::runtime::{ContainerRuntime, ProcessSpec};
use crate::transfer::{DownloadCache, Transfer};

/// Merge environment layers. A later variable replaces an earlier one with
/// the same name in place.
pub fn merge_env<'a>(layers: impl IntoIterator<Item = &'a [EnvVar]>) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = Vec::new();
    for var in layers.into_iter().flatten() {
        match merged.iter_mut().find(|v| v.name == var.name) {
            Some(existing) => existing.value = var.value.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

/// Runs actions against one container.
#[derive(Clone)]
pub struct StepRunner {
    runtime: Arc<dyn ContainerRuntime>,
    transfer: Arc<dyn Transfer>,
    cache: DownloadCache,
    handle: String,
}

impl StepRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        transfer: Arc<dyn Transfer>,
        cache: DownloadCache,
        handle: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            transfer,
            cache,
            handle: handle.into(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Fetch cached dependencies into the container, in order.
    pub async fn install_dependencies(&self, deps: &[CachedDependency]) -> RepResult<()> {
        for dep in deps {
            self.download(&dep.from, &dep.to, dep.cache_key.as_deref())
                .await
                .map_err(|e| match dep.name.as_str() {
                    "" => e,
                    name => RepError::Step(format!("Downloading {name} failed: {e}")),
                })?;
        }
        Ok(())
    }

    pub fn execute<'a>(&'a self, action: &'a Action) -> BoxFuture<'a, RepResult<()>> {
        Box::pin(async move {
            match action {
                Action::Run {
                    path,
                    args,
                    env,
                    dir,
                    user,
                    resource_limits,
                } => {
                    let process = ProcessSpec {
                        path: path.clone(),
                        args: args.clone(),
                        env: merge_env([env.as_slice()]),
                        dir: dir.clone(),
                        user: (!user.is_empty()).then(|| user.clone()),
                        limits: *resource_limits,
                    };
                    debug!(handle = %self.handle, %path, "running process");
                    self.runtime
                        .run(&self.handle, process)
                        .await?
                        .into_result()
                }
                Action::Download {
                    from,
                    to,
                    cache_key,
                    ..
                } => self.download(from, to, cache_key.as_deref()).await,
                Action::Upload { from, to, .. } => {
                    let content = self.runtime.stream_out(&self.handle, from).await?;
                    self.transfer.upload(to, content).await
                }
                Action::Timeout { action, timeout_ms } => {
                    let limit = Duration::from_millis(*timeout_ms);
                    match tokio::time::timeout(limit, self.execute(action)).await {
                        Ok(result) => result,
                        Err(_) => {
                            debug!(handle = %self.handle, ?limit, "action timed out");
                            Err(RepError::TimedOut(format_duration(limit)))
                        }
                    }
                }
                Action::Serial { actions } => {
                    for action in actions {
                        self.execute(action).await?;
                    }
                    Ok(())
                }
                Action::Parallel { actions } => {
                    let results = join_all(actions.iter().map(|a| self.execute(a))).await;
                    results.into_iter().collect()
                }
                Action::Try { action } => {
                    if let Err(e) = self.execute(action).await {
                        warn!(handle = %self.handle, error = %e, "tried action failed, continuing");
                    }
                    Ok(())
                }
                Action::EmitProgress {
                    action,
                    start_message,
                    success_message,
                    failure_prefix,
                } => {
                    if !start_message.is_empty() {
                        info!(handle = %self.handle, "{start_message}");
                    }
                    match self.execute(action).await {
                        Ok(()) => {
                            if !success_message.is_empty() {
                                info!(handle = %self.handle, "{success_message}");
                            }
                            Ok(())
                        }
                        Err(e) if failure_prefix.is_empty() => Err(e),
                        Err(e) => Err(RepError::Step(format!("{failure_prefix}: {e}"))),
                    }
                }
            }
        })
    }

    async fn download(&self, from: &str, to: &str, cache_key: Option<&str>) -> RepResult<()> {
        let cached = match cache_key {
            Some(key) => self.cache.get(key).await,
            None => None,
        };
        let content = match cached {
            Some(content) => content,
            None => {
                let content = self.transfer.download(from).await?;
                if let Some(key) = cache_key {
                    self.cache.insert(key, content.clone()).await;
                }
                content
            }
        };
        self.runtime.stream_in(&self.handle, to, content).await
    }
}
