//! Task API handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info};

use cellgrid_state::{StateError, Task};

use crate::ApiState;
use crate::handlers::{ApiResponse, state_error};

#[derive(Debug, Default, Deserialize)]
pub struct TaskFilter {
    pub domain: Option<String>,
    pub cell_id: Option<String>,
}

/// GET /v1/tasks
pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(filter): Query<TaskFilter>,
) -> Response {
    let tasks = match &filter.domain {
        Some(domain) => state.store.tasks_by_domain(domain),
        None => state.store.tasks(),
    };
    match tasks {
        Ok(tasks) => {
            let tasks: Vec<Task> = tasks
                .into_iter()
                .filter(|t| filter.cell_id.as_ref().is_none_or(|c| &t.cell_id == c))
                .collect();
            ApiResponse::ok(tasks).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// GET /v1/tasks/{guid}
pub async fn get_task(State(state): State<ApiState>, Path(guid): Path<String>) -> Response {
    match state.store.task_by_guid(&guid) {
        Ok(task) => ApiResponse::ok(task).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /v1/tasks
pub async fn desire_task(State(state): State<ApiState>, Json(task): Json<Task>) -> Response {
    match state.store.desire_task(task) {
        Ok(task) => {
            state.auctioneer.request_task_start(&task.task_guid);
            (StatusCode::CREATED, ApiResponse::ok(task)).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// POST /v1/tasks/{guid}/cancel
///
/// Marks the task failed and asks its cell, if any, to stop the container.
pub async fn cancel_task(State(state): State<ApiState>, Path(guid): Path<String>) -> Response {
    let task = match state.store.cancel_task(&guid) {
        Ok(task) => task,
        Err(e) => return state_error(&e),
    };
    if !task.cell_id.is_empty() {
        if let Some(client) = state.cells.get(&task.cell_id).await {
            if let Err(e) = client.cancel_task(&guid).await {
                debug!(task_guid = %guid, cell_id = %task.cell_id, error = %e, "cell cancel failed");
            }
        }
    }
    info!(task_guid = %guid, "task cancelled");
    ApiResponse::ok(task).into_response()
}

/// POST /v1/tasks/{guid}/resolve
///
/// Completed → Resolving → deleted. Returns the task as it completed.
pub async fn resolve_task(State(state): State<ApiState>, Path(guid): Path<String>) -> Response {
    let task = match state.store.resolving_task(&guid) {
        Ok(task) => task,
        Err(e) => return state_error(&e),
    };
    match state.store.delete_task(&guid) {
        Ok(()) => ApiResponse::ok(task).into_response(),
        Err(StateError::NotFound(_)) => ApiResponse::ok(task).into_response(),
        Err(e) => state_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cellgrid_placement::{CellClient, CellClientError, CellState, Work};
    use cellgrid_state::{ActualLrpKey, TaskState};
    use serde_json::json;

    use crate::testing::{call, task, test_state};

    /// Records cancels; everything else is unused here.
    #[derive(Default)]
    struct RecordingCell {
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CellClient for RecordingCell {
        fn cell_id(&self) -> &str {
            "cell-a"
        }

        async fn state(&self) -> Result<CellState, CellClientError> {
            Err(CellClientError::Unreachable("cell-a".to_string()))
        }

        async fn perform(&self, work: Work) -> Result<Work, CellClientError> {
            Ok(work)
        }

        async fn stop_lrp_instance(
            &self,
            _key: &ActualLrpKey,
            _instance_guid: &str,
        ) -> Result<(), CellClientError> {
            Ok(())
        }

        async fn cancel_task(&self, task_guid: &str) -> Result<(), CellClientError> {
            self.cancelled.lock().unwrap().push(task_guid.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn desire_list_and_get_task() {
        let (state, _auctioneer) = test_state();
        let body = serde_json::to_value(task("t1")).unwrap();

        let (status, created) = call(&state, "POST", "/v1/tasks", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["state"], "pending");

        let (status, listed) = call(&state, "GET", "/v1/tasks?domain=tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let (_, listed) = call(&state, "GET", "/v1/tasks?domain=other", None).await;
        assert_eq!(listed["data"], json!([]));

        let (status, _) = call(&state, "GET", "/v1/tasks/t1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "GET", "/v1/tasks/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_reaches_the_running_cell() {
        let (state, _auctioneer) = test_state();
        let cell = Arc::new(RecordingCell::default());
        state.cells.register(cell.clone()).await;
        state.store.desire_task(task("t1")).unwrap();
        state.store.start_task("t1", "cell-a").unwrap();

        let (status, body) = call(&state, "POST", "/v1/tasks/t1/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["failed"], true);
        assert_eq!(body["data"]["failure_reason"], "task was cancelled");
        assert_eq!(*cell.cancelled.lock().unwrap(), vec!["t1".to_string()]);

        // Already completed.
        let (status, _) = call(&state, "POST", "/v1/tasks/t1/cancel", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn resolve_deletes_completed_tasks_only() {
        let (state, _auctioneer) = test_state();
        state.store.desire_task(task("t1")).unwrap();

        let (status, _) = call(&state, "POST", "/v1/tasks/t1/resolve", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        state.store.start_task("t1", "cell-a").unwrap();
        state
            .store
            .complete_task("t1", "cell-a", false, "", "42")
            .unwrap();

        let (status, body) = call(&state, "POST", "/v1/tasks/t1/resolve", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["result"], "42");
        assert!(
            state
                .store
                .task_by_guid("t1")
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(
            state.store.tasks().unwrap().iter().filter(|t| t.state == TaskState::Resolving).count(),
            0
        );
    }
}
