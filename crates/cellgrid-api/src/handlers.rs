//! REST API handlers for LRPs, cells and routes.
//!
//! Each handler reads or writes via `StateStore` and returns the JSON
//! envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use cellgrid_placement::retire_actual_lrp;
use cellgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_)
        | StateError::Conflict(_)
        | StateError::InvalidTransition { .. } => StatusCode::CONFLICT,
        StateError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "store request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Desired LRPs ───────────────────────────────────────────────

/// GET /v1/desired_lrps
pub async fn list_desired_lrps(State(state): State<ApiState>) -> Response {
    match state.store.desired_lrps() {
        Ok(lrps) => ApiResponse::ok(lrps).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /v1/desired_lrps/{guid}
pub async fn get_desired_lrp(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
) -> Response {
    match state.store.desired_lrp_by_process_guid(&guid) {
        Ok(lrp) => ApiResponse::ok(lrp).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /v1/desired_lrps
pub async fn desire_lrp(State(state): State<ApiState>, Json(lrp): Json<DesiredLrp>) -> Response {
    let process_guid = lrp.process_guid.clone();
    let created = match state.store.desire_lrp(lrp) {
        Ok(created) => created,
        Err(e) => return state_error(&e),
    };
    state.auctioneer.request_lrp_starts(created);
    match state.store.desired_lrp_by_process_guid(&process_guid) {
        Ok(lrp) => (StatusCode::CREATED, ApiResponse::ok(lrp)).into_response(),
        Err(e) => state_error(&e),
    }
}

/// PATCH /v1/desired_lrps/{guid}
pub async fn update_desired_lrp(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
    Json(update): Json<DesiredLrpUpdate>,
) -> Response {
    let outcome = match state.store.update_desired_lrp(&guid, &update) {
        Ok(outcome) => outcome,
        Err(e) => return state_error(&e),
    };
    state.auctioneer.request_lrp_starts(outcome.created);
    for actual in &outcome.excess {
        if let Err(e) = retire_actual_lrp(&state.store, &state.cells, actual).await {
            // The converger retires it on its next sweep.
            warn!(key = %actual.key(), error = %e, "failed to retire excess instance");
        }
    }
    ApiResponse::ok(outcome.desired).into_response()
}

/// DELETE /v1/desired_lrps/{guid}
pub async fn remove_desired_lrp(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
) -> Response {
    let removed = match state.store.remove_desired_lrp(&guid) {
        Ok(removed) => removed,
        Err(e) => return state_error(&e),
    };
    for actual in removed.iter().filter(|a| a.is_owned()) {
        let Some(client) = state.cells.get(&actual.cell_id).await else {
            continue;
        };
        if let Err(e) = client
            .stop_lrp_instance(&actual.key(), &actual.instance_guid)
            .await
        {
            // The cell's reconcile loop tears the container down.
            debug!(key = %actual.key(), cell_id = %actual.cell_id, error = %e, "stop failed");
        }
    }
    ApiResponse::ok("deleted").into_response()
}

// ── Actual LRPs ────────────────────────────────────────────────

/// GET /v1/actual_lrp_groups/{guid}
pub async fn actual_lrp_groups(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
) -> Response {
    match state.store.actual_lrp_groups_by_process_guid(&guid) {
        Ok(groups) => ApiResponse::ok(groups).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /v1/actual_lrp_groups/{guid}/{index}
pub async fn actual_lrp_group(
    State(state): State<ApiState>,
    Path((guid, index)): Path<(String, u32)>,
) -> Response {
    match state
        .store
        .actual_lrp_group_by_process_guid_and_index(&guid, index)
    {
        Ok(group) => ApiResponse::ok(group).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Cells and routes ───────────────────────────────────────────

/// GET /v1/cells
pub async fn list_cells(State(state): State<ApiState>) -> Response {
    match state.store.cells(epoch_millis()) {
        Ok(cells) => ApiResponse::ok(cells).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /v1/routes
pub async fn routes(State(state): State<ApiState>) -> Response {
    match state.store.routing_table() {
        Ok(table) => ApiResponse::ok(table).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /ping
pub async fn ping() -> impl IntoResponse {
    ApiResponse::ok("pong")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::{call, desired, test_state};

    #[tokio::test]
    async fn ping_answers() {
        let (state, _auctioneer) = test_state();
        let (status, body) = call(&state, "GET", "/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "pong");
    }

    #[tokio::test]
    async fn desire_and_get_lrp() {
        let (state, _auctioneer) = test_state();
        let lrp = serde_json::to_value(desired("web", 2)).unwrap();

        let (status, body) = call(&state, "POST", "/v1/desired_lrps", Some(lrp)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["process_guid"], "web");

        let (status, body) = call(&state, "GET", "/v1/desired_lrps/web", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["instances"], 2);

        let (status, body) = call(&state, "GET", "/v1/actual_lrp_groups/web", None).await;
        assert_eq!(status, StatusCode::OK);
        let groups = body["data"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1]["instance"]["state"], "unclaimed");
    }

    #[tokio::test]
    async fn duplicate_lrp_conflicts() {
        let (state, _auctioneer) = test_state();
        state.store.desire_lrp(desired("web", 1)).unwrap();
        let lrp = serde_json::to_value(desired("web", 1)).unwrap();

        let (status, body) = call(&state, "POST", "/v1/desired_lrps", Some(lrp)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn invalid_lrp_is_bad_request() {
        let (state, _auctioneer) = test_state();
        let mut lrp = desired("web", 1);
        lrp.rootfs = "nonsense".to_string();
        let lrp = serde_json::to_value(lrp).unwrap();

        let (status, _) = call(&state, "POST", "/v1/desired_lrps", Some(lrp)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scale_up_then_down() {
        let (state, _auctioneer) = test_state();
        state.store.desire_lrp(desired("web", 1)).unwrap();

        let (status, body) = call(
            &state,
            "PATCH",
            "/v1/desired_lrps/web",
            Some(json!({"instances": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["instances"], 3);
        assert_eq!(
            state.store.actual_lrp_groups_by_process_guid("web").unwrap().len(),
            3
        );

        let (status, _) = call(
            &state,
            "PATCH",
            "/v1/desired_lrps/web",
            Some(json!({"instances": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.store.actual_lrp_groups_by_process_guid("web").unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_lrp_and_missing_lrp() {
        let (state, _auctioneer) = test_state();
        state.store.desire_lrp(desired("web", 2)).unwrap();

        let (status, _) = call(&state, "DELETE", "/v1/desired_lrps/web", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.store.actual_lrps().unwrap().is_empty());

        let (status, body) = call(&state, "DELETE", "/v1/desired_lrps/web", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("web"));
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let (state, _auctioneer) = test_state();
        state.store.desire_lrp(desired("web", 1)).unwrap();

        let (status, body) = call(&state, "GET", "/v1/actual_lrp_groups/web/0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["instance"]["index"], 0);

        let (status, _) = call(&state, "GET", "/v1/actual_lrp_groups/web/4", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn routes_follow_running_instances() {
        let (state, _auctioneer) = test_state();
        let mut lrp = desired("web", 1);
        lrp.routes = vec![Route {
            port: 8080,
            hostnames: vec!["web.example.com".to_string()],
        }];
        state.store.desire_lrp(lrp).unwrap();

        let (_, body) = call(&state, "GET", "/v1/routes", None).await;
        assert_eq!(body["data"], json!({}));

        let key = ActualLrpKey::new("web", 0);
        state.store.claim_actual_lrp(&key, "ig-1", "cell-a").unwrap();
        state
            .store
            .start_actual_lrp(
                &key,
                "ig-1",
                "cell-a",
                NetInfo {
                    address: "10.0.0.1".to_string(),
                    ports: vec![PortMapping {
                        container_port: 8080,
                        host_port: 61000,
                    }],
                },
            )
            .unwrap();

        let (status, body) = call(&state, "GET", "/v1/routes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"web.example.com": ["10.0.0.1:61000"]}));
    }

    #[tokio::test]
    async fn cells_lists_live_presences() {
        let (state, _auctioneer) = test_state();
        let (status, body) = call(&state, "GET", "/v1/cells", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }
}
