//! Task lifecycle: Pending → Running → Completed → Resolving → removed.
//!
//! A task that never ran may jump from Pending to Completed with
//! `failed = true`; nothing moves backwards.

use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::events::StoreEvent;
use crate::store::{StateStore, get_json, put_versioned, remove_key};
use crate::tables::TASKS;
use crate::types::*;

pub const TASK_CANCELLED: &str = "task was cancelled";

fn invalid(task: &Task, to: TaskState) -> StateError {
    StateError::InvalidTransition {
        key: task.task_guid.clone(),
        from: task.state.to_string(),
        to: to.to_string(),
    }
}

impl StateStore {
    pub fn desire_task(&self, mut task: Task) -> StateResult<Task> {
        task.validate()?;
        let now = epoch_millis();
        task.state = TaskState::Pending;
        task.cell_id.clear();
        task.failed = false;
        task.failure_reason.clear();
        task.result.clear();
        task.created_at = now;
        task.updated_at = now;
        task.first_completed_at = None;
        task.modification_index = 0;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            if get_json::<Task, _>(&table, &task.task_guid)?.is_some() {
                return Err(StateError::AlreadyExists(task.task_guid));
            }
            put_versioned(&mut table, &task.task_guid.clone(), &mut task)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        info!(task_guid = %task.task_guid, domain = %task.domain, "task desired");
        self.emit_task(&task);
        Ok(task)
    }

    /// Pending → Running on `cell_id`.
    ///
    /// Returns `true` if this call started the task and `false` if the same
    /// cell already had. Another cell gets `Conflict`.
    pub fn start_task(&self, task_guid: &str, cell_id: &str) -> StateResult<bool> {
        let (task, changed) = self.mutate::<Task, _>(TASKS, task_guid, |t| match t.state {
            TaskState::Pending => {
                t.state = TaskState::Running;
                t.cell_id = cell_id.to_string();
                t.updated_at = epoch_millis();
                Ok(true)
            }
            TaskState::Running if t.cell_id == cell_id => Ok(false),
            TaskState::Running => Err(StateError::Conflict(format!(
                "task {task_guid} already running on {}",
                t.cell_id
            ))),
            _ => Err(invalid(t, TaskState::Running)),
        })?;
        if changed {
            info!(%task_guid, %cell_id, "task started");
            self.emit_task(&task);
        }
        Ok(changed)
    }

    /// Stamp a Pending task as just handed to the auctioneer.
    pub fn requeue_task(&self, task_guid: &str) -> StateResult<Task> {
        let (task, _) = self.mutate::<Task, _>(TASKS, task_guid, |t| {
            if t.state != TaskState::Pending {
                return Err(invalid(t, TaskState::Pending));
            }
            t.updated_at = epoch_millis();
            Ok(true)
        })?;
        debug!(%task_guid, "task requeued for placement");
        Ok(task)
    }

    /// Running → Completed, reported by the cell that ran it.
    pub fn complete_task(
        &self,
        task_guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> StateResult<Task> {
        let (task, _) = self.mutate::<Task, _>(TASKS, task_guid, |t| {
            if t.state != TaskState::Running {
                return Err(invalid(t, TaskState::Completed));
            }
            if t.cell_id != cell_id {
                return Err(StateError::Conflict(format!(
                    "task {task_guid} is running on {}, not {cell_id}",
                    t.cell_id
                )));
            }
            mark_completed(t, failed, failure_reason);
            t.result = result.to_string();
            Ok(true)
        })?;
        info!(%task_guid, %cell_id, failed, %failure_reason, "task completed");
        self.emit_completed(&task);
        Ok(task)
    }

    /// Pending or Running → Completed with `failed = true`.
    ///
    /// Used when the task cannot be placed, its cell vanished or it sat
    /// pending for too long.
    pub fn fail_task(&self, task_guid: &str, failure_reason: &str) -> StateResult<Task> {
        let (task, _) = self.mutate::<Task, _>(TASKS, task_guid, |t| match t.state {
            TaskState::Pending | TaskState::Running => {
                mark_completed(t, true, failure_reason);
                Ok(true)
            }
            _ => Err(invalid(t, TaskState::Completed)),
        })?;
        info!(%task_guid, %failure_reason, "task failed");
        self.emit_completed(&task);
        Ok(task)
    }

    pub fn cancel_task(&self, task_guid: &str) -> StateResult<Task> {
        self.fail_task(task_guid, TASK_CANCELLED)
    }

    /// Completed → Resolving. Exactly one of several racing resolvers wins;
    /// the rest get `Conflict`.
    pub fn resolving_task(&self, task_guid: &str) -> StateResult<Task> {
        let (task, _) = self.mutate::<Task, _>(TASKS, task_guid, |t| match t.state {
            TaskState::Completed => {
                t.state = TaskState::Resolving;
                t.updated_at = epoch_millis();
                Ok(true)
            }
            TaskState::Resolving => Err(StateError::Conflict(format!(
                "task {task_guid} is already resolving"
            ))),
            _ => Err(invalid(t, TaskState::Resolving)),
        })?;
        debug!(%task_guid, "task resolving");
        self.emit_task(&task);
        Ok(task)
    }

    /// Remove a Resolving task.
    pub fn delete_task(&self, task_guid: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let task: Task = get_json(&table, task_guid)?
                .ok_or_else(|| StateError::NotFound(task_guid.to_string()))?;
            if task.state != TaskState::Resolving {
                return Err(StateError::InvalidTransition {
                    key: task_guid.to_string(),
                    from: task.state.to_string(),
                    to: "DELETED".to_string(),
                });
            }
            remove_key(&mut table, task_guid)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%task_guid, "task deleted");
        self.emit([StoreEvent::TaskRemoved {
            task_guid: task_guid.to_string(),
        }]);
        Ok(())
    }

    pub fn task_by_guid(&self, task_guid: &str) -> StateResult<Task> {
        self.read_one(TASKS, task_guid)?
            .ok_or_else(|| StateError::NotFound(task_guid.to_string()))
    }

    pub fn tasks(&self) -> StateResult<Vec<Task>> {
        self.read_all(TASKS, None)
    }

    pub fn tasks_by_domain(&self, domain: &str) -> StateResult<Vec<Task>> {
        Ok(self
            .tasks()?
            .into_iter()
            .filter(|t| t.domain == domain)
            .collect())
    }

    pub fn tasks_by_cell(&self, cell_id: &str) -> StateResult<Vec<Task>> {
        Ok(self
            .tasks()?
            .into_iter()
            .filter(|t| t.cell_id == cell_id)
            .collect())
    }

    fn emit_task(&self, task: &Task) {
        self.emit([StoreEvent::TaskChanged {
            task_guid: task.task_guid.clone(),
            state: task.state,
        }]);
    }

    fn emit_completed(&self, task: &Task) {
        self.emit([
            StoreEvent::TaskChanged {
                task_guid: task.task_guid.clone(),
                state: task.state,
            },
            StoreEvent::TaskCompleted {
                task_guid: task.task_guid.clone(),
                domain: task.domain.clone(),
                failed: task.failed,
            },
        ]);
    }
}

fn mark_completed(task: &mut Task, failed: bool, failure_reason: &str) {
    let now = epoch_millis();
    task.state = TaskState::Completed;
    task.failed = failed;
    task.failure_reason = if failed {
        failure_reason.to_string()
    } else {
        String::new()
    };
    task.updated_at = now;
    task.first_completed_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn task(guid: &str) -> Task {
        Task {
            task_guid: guid.to_string(),
            domain: "test-domain".to_string(),
            rootfs: "preloaded:cflinuxfs".to_string(),
            action: Action::run("echo", &["hi"]),
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

    #[test]
    fn full_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        assert!(store.start_task("t1", "cell-1").unwrap());

        let completed = store
            .complete_task("t1", "cell-1", false, "", "{\"ok\":true}")
            .unwrap();
        assert_eq!(completed.state, TaskState::Completed);
        assert_eq!(completed.result, "{\"ok\":true}");
        assert!(completed.first_completed_at.is_some());

        store.resolving_task("t1").unwrap();
        store.delete_task("t1").unwrap();
        assert!(store.task_by_guid("t1").unwrap_err().is_not_found());
    }

    #[test]
    fn requeue_only_touches_pending_tasks() {
        let store = StateStore::open_in_memory().unwrap();
        let desired = store.desire_task(task("t1")).unwrap();
        let requeued = store.requeue_task("t1").unwrap();
        assert!(requeued.updated_at >= desired.updated_at);
        assert_eq!(requeued.created_at, desired.created_at);
        assert_eq!(requeued.state, TaskState::Pending);

        store.start_task("t1", "cell-1").unwrap();
        assert!(matches!(
            store.requeue_task("t1"),
            Err(StateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cannot_skip_or_reverse() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();

        assert!(matches!(
            store.complete_task("t1", "cell-1", false, "", ""),
            Err(StateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.resolving_task("t1"),
            Err(StateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.delete_task("t1"),
            Err(StateError::InvalidTransition { .. })
        ));

        store.start_task("t1", "cell-1").unwrap();
        store.complete_task("t1", "cell-1", true, "boom", "").unwrap();
        assert!(matches!(
            store.start_task("t1", "cell-1"),
            Err(StateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn same_cell_start_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        assert!(store.start_task("t1", "cell-1").unwrap());
        assert!(!store.start_task("t1", "cell-1").unwrap());
        assert!(store.start_task("t1", "cell-2").unwrap_err().is_conflict());
    }

    #[test]
    fn racing_starts_have_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();

        let wins = Arc::new(AtomicU32::new(0));
        let conflicts = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let wins = wins.clone();
                let conflicts = conflicts.clone();
                std::thread::spawn(move || match store.start_task("t1", &format!("cell-{i}")) {
                    Ok(true) => {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) if e.is_conflict() => {
                        conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                    other => panic!("unexpected start outcome: {other:?}"),
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(conflicts.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn racing_resolvers_have_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        store.fail_task("t1", "found no compatible cell").unwrap();

        assert!(store.resolving_task("t1").is_ok());
        assert!(store.resolving_task("t1").unwrap_err().is_conflict());
    }

    #[test]
    fn fail_pending_task_never_ran() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        let failed = store.fail_task("t1", "found no compatible cell").unwrap();
        assert_eq!(failed.state, TaskState::Completed);
        assert!(failed.failed);
        assert_eq!(failed.failure_reason, "found no compatible cell");
        assert!(failed.cell_id.is_empty());
    }

    #[test]
    fn complete_from_wrong_cell_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        store.start_task("t1", "cell-1").unwrap();
        assert!(
            store
                .complete_task("t1", "cell-2", false, "", "")
                .unwrap_err()
                .is_conflict()
        );
    }

    #[test]
    fn cancel_marks_failed() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        let cancelled = store.cancel_task("t1").unwrap();
        assert!(cancelled.failed);
        assert_eq!(cancelled.failure_reason, TASK_CANCELLED);
    }

    #[test]
    fn desire_resets_server_owned_fields() {
        let store = StateStore::open_in_memory().unwrap();
        let mut t = task("t1");
        t.state = TaskState::Completed;
        t.failed = true;
        let stored = store.desire_task(t).unwrap();
        assert_eq!(stored.state, TaskState::Pending);
        assert!(!stored.failed);
        assert_eq!(stored.modification_index, 1);
        assert!(matches!(
            store.desire_task(task("t1")),
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn filters_by_domain() {
        let store = StateStore::open_in_memory().unwrap();
        store.desire_task(task("t1")).unwrap();
        let mut other = task("t2");
        other.domain = "staging".to_string();
        store.desire_task(other).unwrap();
        let staging = store.tasks_by_domain("staging").unwrap();
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].task_guid, "t2");
    }
}
