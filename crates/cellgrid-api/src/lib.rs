//! cellgrid-api — REST API for CellGrid.
//!
//! Axum handlers over the state store. Mutations return after the store
//! commit; placement and stops are handed to the auctioneer and the owning
//! cells.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v1/desired_lrps` | List desired LRPs |
//! | POST | `/v1/desired_lrps` | Desire an LRP |
//! | GET | `/v1/desired_lrps/{guid}` | Get a desired LRP |
//! | PATCH | `/v1/desired_lrps/{guid}` | Change instances, routes or annotation |
//! | DELETE | `/v1/desired_lrps/{guid}` | Remove a desired LRP and its instances |
//! | GET | `/v1/actual_lrp_groups/{guid}` | Instances of one LRP |
//! | GET | `/v1/actual_lrp_groups/{guid}/{index}` | One instance |
//! | GET | `/v1/tasks` | List tasks, optionally `?domain=` |
//! | POST | `/v1/tasks` | Desire a task |
//! | GET | `/v1/tasks/{guid}` | Get a task |
//! | POST | `/v1/tasks/{guid}/cancel` | Cancel a task |
//! | POST | `/v1/tasks/{guid}/resolve` | Resolve and delete a completed task |
//! | GET | `/v1/cells` | Live cells |
//! | GET | `/v1/routes` | Routing table |
//! | GET | `/ping` | Liveness |

pub mod handlers;
pub mod task_handlers;

use axum::Router;
use axum::routing::{get, post};
use cellgrid_placement::{AuctioneerHandle, CellDirectory};
use cellgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub cells: CellDirectory,
    pub auctioneer: AuctioneerHandle,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/desired_lrps",
            get(handlers::list_desired_lrps).post(handlers::desire_lrp),
        )
        .route(
            "/desired_lrps/{guid}",
            get(handlers::get_desired_lrp)
                .patch(handlers::update_desired_lrp)
                .delete(handlers::remove_desired_lrp),
        )
        .route(
            "/actual_lrp_groups/{guid}",
            get(handlers::actual_lrp_groups),
        )
        .route(
            "/actual_lrp_groups/{guid}/{index}",
            get(handlers::actual_lrp_group),
        )
        .route(
            "/tasks",
            get(task_handlers::list_tasks).post(task_handlers::desire_task),
        )
        .route("/tasks/{guid}", get(task_handlers::get_task))
        .route("/tasks/{guid}/cancel", post(task_handlers::cancel_task))
        .route("/tasks/{guid}/resolve", post(task_handlers::resolve_task))
        .route("/cells", get(handlers::list_cells))
        .route("/routes", get(handlers::routes));

    Router::new()
        .nest("/v1", api_routes)
        .route("/ping", get(handlers::ping))
        .with_state(state)
}
