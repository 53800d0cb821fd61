//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use devshare_core::{
    DevshareError, InventoryEvent, NodeDeviceSummary, WorkloadEvent, WorkloadSpec,
};
use devshare_scheduler::{AdmissionOutcome, Coordinator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Create the API router
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let state = Arc::new(AppState { coordinator });

    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/:node", get(get_node).delete(delete_node))
        .route("/api/v1/events/inventory", post(apply_inventory_event))
        .route("/api/v1/events/workloads", post(apply_workload_event))
        .route("/api/v1/admissions", post(admit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn error_response(e: DevshareError) -> ApiError {
    let status = match &e {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        DevshareError::MissingDevice(_) => StatusCode::NOT_FOUND,
        DevshareError::InsufficientDevices { .. } | DevshareError::ConflictOnCommit(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn node_not_found(node: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("Node not found: {}", node))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub nodes: usize,
    pub allocations: usize,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let summaries = state.coordinator.all_node_summaries();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes: summaries.len(),
        allocations: summaries.values().map(|s| s.allocations.len()).sum(),
    })
}

/// List every node's device summary
async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeDeviceSummary>> {
    Json(state.coordinator.all_node_summaries().into_values().collect())
}

/// Get one node's device summary
async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Result<Json<NodeDeviceSummary>, ApiError> {
    state
        .coordinator
        .node_summary(&node)
        .map(Json)
        .ok_or_else(|| node_not_found(&node))
}

/// Drop a node and everything recorded against it
async fn delete_node(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(node = %node, "Removing node");

    if state.coordinator.inventory().remove_node(&node) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(node_not_found(&node))
    }
}

/// Apply a device inventory change
async fn apply_inventory_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InventoryEvent>,
) -> StatusCode {
    state.coordinator.inventory().apply_inventory_event(&event);
    StatusCode::NO_CONTENT
}

/// Apply a workload assignment or deletion
async fn apply_workload_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<WorkloadEvent>,
) -> StatusCode {
    state.coordinator.inventory().apply_workload_event(&event);
    StatusCode::NO_CONTENT
}

/// Request to admit a workload
#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    /// Workload to admit
    pub workload: WorkloadSpec,
    /// Candidate nodes in preference order; empty means every known node
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Admit a workload onto the first feasible candidate
async fn admit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdmitRequest>,
) -> Result<Json<AdmissionOutcome>, ApiError> {
    info!(
        workload = %req.workload.key(),
        candidates = req.nodes.len(),
        "Admitting workload"
    );

    state
        .coordinator
        .admit(&req.workload, &req.nodes)
        .await
        .map(Json)
        .map_err(error_response)
}
