//! The stager: staging messages in, staging tasks out, one reply each.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cellgrid_core::StagerConfig;
use cellgrid_placement::AuctioneerHandle;
use cellgrid_state::{StateError, StateStore, StoreEvent, TaskState};

use crate::bus::MessageBus;
use crate::error::{StagerError, StagerResult};
use crate::message::{STAGING_DOMAIN, StagingRequest, StagingResponse, staging_task};

/// Several stagers may share one store and bus. The task guid dedupes
/// starts and the `resolving_task` CAS picks the one that replies.
#[derive(Clone)]
pub struct Stager {
    store: StateStore,
    bus: MessageBus,
    auctioneer: AuctioneerHandle,
    config: StagerConfig,
}

impl Stager {
    pub fn new(
        store: StateStore,
        bus: MessageBus,
        auctioneer: AuctioneerHandle,
        config: StagerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            auctioneer,
            config,
        }
    }

    pub fn start_subject(&self) -> String {
        format!("{}.start", self.config.topic)
    }

    pub fn finished_subject(&self) -> String {
        format!("{}.finished", self.config.topic)
    }

    /// Handle one start message. Returns `true` if this call desired the
    /// staging task.
    pub fn handle_start(&self, payload: &[u8]) -> StagerResult<bool> {
        let request: StagingRequest = serde_json::from_slice(payload)?;
        let Some(compiler) = self.config.compilers.get(&request.stack) else {
            let err = StagerError::UnknownStack(request.stack.clone());
            warn!(
                app_id = %request.app_id,
                task_id = %request.task_id,
                stack = %request.stack,
                "no compiler for stack"
            );
            self.reply(&StagingResponse::failed(
                &request.app_id,
                &request.task_id,
                err.to_string(),
            ))?;
            return Ok(false);
        };

        let task = staging_task(&request, compiler, &self.config)?;
        match self.store.desire_task(task) {
            Ok(task) => {
                info!(
                    app_id = %request.app_id,
                    task_id = %request.task_id,
                    task_guid = %task.task_guid,
                    "staging requested"
                );
                self.auctioneer.request_task_start(&task.task_guid);
                Ok(true)
            }
            Err(StateError::AlreadyExists(task_guid)) => {
                debug!(%task_guid, "staging already in progress");
                Ok(false)
            }
            Err(e) => {
                self.reply(&StagingResponse::failed(
                    &request.app_id,
                    &request.task_id,
                    e.to_string(),
                ))?;
                Err(e.into())
            }
        }
    }

    /// Resolve a completed staging task and publish its reply. Returns
    /// `false` if the task is not ours to resolve, including when another
    /// stager got there first.
    pub fn handle_completed(&self, task_guid: &str) -> StagerResult<bool> {
        let task = match self.store.task_by_guid(task_guid) {
            Ok(task) => task,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if task.domain != STAGING_DOMAIN || task.state != TaskState::Completed {
            return Ok(false);
        }

        let task = match self.store.resolving_task(task_guid) {
            Ok(task) => task,
            Err(e) if e.is_conflict() || e.is_not_found() => return Ok(false),
            Err(StateError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let response = match StagingResponse::from_task(&task) {
            Ok(response) => response,
            Err(e) => {
                warn!(%task_guid, error = %e, "unreadable staging result");
                let (app_id, task_id) = task_guid_parts(&task.task_guid);
                StagingResponse::failed(app_id, task_id, e.to_string())
            }
        };
        self.reply(&response)?;
        info!(
            %task_guid,
            app_id = %response.app_id,
            failed = response.error.is_some(),
            "staging finished"
        );
        self.store.delete_task(task_guid)?;
        Ok(true)
    }

    /// Resolve every completed staging task. Covers completions that
    /// happened while no stager was listening.
    pub fn sweep(&self) -> StagerResult<usize> {
        let mut resolved = 0;
        for task in self.store.tasks_by_domain(STAGING_DOMAIN)? {
            if task.state == TaskState::Completed && self.handle_completed(&task.task_guid)? {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    fn reply(&self, response: &StagingResponse) -> StagerResult<()> {
        self.bus.publish_json(&self.finished_subject(), response)?;
        Ok(())
    }

    fn sweep_logged(&self) {
        match self.sweep() {
            Ok(0) => {}
            Ok(resolved) => info!(resolved, "resolved completed staging tasks"),
            Err(e) => warn!(error = %e, "staging sweep failed"),
        }
    }

    /// Consume start messages and task completions until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut starts = self.bus.subscribe(&self.start_subject());
        let mut events = self.store.subscribe();
        info!(topic = %self.config.topic, "stager started");
        self.sweep_logged();

        loop {
            tokio::select! {
                message = starts.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = self.handle_start(&message.payload) {
                        warn!(error = %e, "staging request failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(StoreEvent::TaskCompleted { task_guid, domain, .. })
                        if domain == STAGING_DOMAIN =>
                    {
                        if let Err(e) = self.handle_completed(&task_guid) {
                            warn!(%task_guid, error = %e, "failed to resolve staging task");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stager lagged behind store events");
                        self.sweep_logged();
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    info!("stager shutting down");
                    break;
                }
            }
        }
    }
}

/// Best-effort split of `staging-<app>-<task>` for replies to tasks whose
/// annotation is unreadable.
fn task_guid_parts(task_guid: &str) -> (&str, &str) {
    let rest = task_guid.strip_prefix("staging-").unwrap_or(task_guid);
    rest.rsplit_once('-').unwrap_or((rest, ""))
}
