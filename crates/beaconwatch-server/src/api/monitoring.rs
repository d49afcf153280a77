//! Monitoring API endpoints.
//!
//! Monitored regions report when they become occupied and when they have
//! been silent for the exit period. Transitions appear in `GET /api/events`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use beaconwatch_core::{MonitoredRegion, RegionState};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ranging::{RegionRequest, RegionResponse};
use crate::state::SharedState;

/// Subscriber recorded when a request names none.
pub const DEFAULT_TARGET: &str = "default";

/// Creates the monitoring router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_monitoring))
        .route(
            "/{id}",
            get(get_monitoring).put(start_monitoring).delete(stop_monitoring),
        )
        .route("/{id}/state", put(force_state))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for monitoring a region.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identifiers": ["2f234454-cf6d-4a0f-adf2-f4911ba9ffa6", null, null],
    "bluetooth_address": null,
    "target": "front-desk"
}))]
pub struct MonitorRegionRequest {
    /// Identifier slots in order; `null` matches anything.
    #[serde(default)]
    pub identifiers: Vec<Option<String>>,

    /// Restricts the region to one transmitter.
    #[serde(default)]
    #[schema(nullable)]
    pub bluetooth_address: Option<String>,

    /// Subscriber name carried on this region's events.
    #[serde(default)]
    #[schema(nullable, example = "front-desk")]
    pub target: Option<String>,
}

/// A monitored region and its occupancy.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "region": { "unique_id": "lobby", "identifiers": [], "bluetooth_address": null },
    "state": "inside",
    "target": "default",
    "last_seen_ms": 1_700_000_000_000_i64
}))]
pub struct MonitoredRegionResponse {
    /// The monitored region.
    pub region: RegionResponse,
    /// Current occupancy.
    pub state: RegionState,
    /// Subscriber for this region's events.
    pub target: String,
    /// Last matching sighting on the server clock.
    #[schema(nullable)]
    pub last_seen_ms: Option<i64>,
}

impl From<&MonitoredRegion> for MonitoredRegionResponse {
    fn from(monitored: &MonitoredRegion) -> Self {
        Self {
            region: RegionResponse::from(&monitored.region),
            state: monitored.state,
            target: monitored.target.clone(),
            last_seen_ms: monitored.last_seen_ms,
        }
    }
}

/// Request body for overriding a region's state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "state": "outside" }))]
pub struct ForceStateRequest {
    /// State to record. No events are emitted.
    pub state: RegionState,
}

// ============================================================================
// Handlers
// ============================================================================

/// List monitored regions.
#[utoipa::path(
    get,
    path = "/api/monitoring",
    tag = "monitoring",
    operation_id = "listMonitoring",
    summary = "List monitored regions",
    description = "Returns monitored regions in the order they were added, with their occupancy.",
    responses(
        (status = 200, description = "Monitored regions", body = Vec<MonitoredRegionResponse>)
    )
)]
pub async fn list_monitoring(
    State(state): State<SharedState>,
) -> Json<Vec<MonitoredRegionResponse>> {
    Json(
        state
            .engine()
            .monitored_regions()
            .iter()
            .map(MonitoredRegionResponse::from)
            .collect(),
    )
}

/// Get one monitored region.
#[utoipa::path(
    get,
    path = "/api/monitoring/{id}",
    tag = "monitoring",
    operation_id = "getMonitoring",
    summary = "Get a monitored region",
    params(("id" = String, Path, description = "Region id")),
    responses(
        (status = 200, description = "Monitored region", body = MonitoredRegionResponse),
        (status = 404, description = "Region is not monitored", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_monitoring(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MonitoredRegionResponse>> {
    find_monitored(&state, &id).map(|m| Json(MonitoredRegionResponse::from(&m)))
}

/// Start monitoring a region.
#[utoipa::path(
    put,
    path = "/api/monitoring/{id}",
    tag = "monitoring",
    operation_id = "startMonitoring",
    summary = "Start monitoring a region",
    description = "Starts monitoring the region. Regions start outside; re-adding a \
        region with the same id keeps its current occupancy.",
    params(("id" = String, Path, description = "Region id")),
    request_body = MonitorRegionRequest,
    responses(
        (status = 200, description = "Region is monitored", body = MonitoredRegionResponse),
        (status = 400, description = "Invalid region", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn start_monitoring(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<MonitorRegionRequest>,
) -> ApiResult<Json<MonitoredRegionResponse>> {
    let target = request
        .target
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TARGET.to_string());
    let region = RegionRequest {
        identifiers: request.identifiers,
        bluetooth_address: request.bluetooth_address,
    }
    .into_criteria(&id)?;
    state.engine().start_monitoring(region, target)?;
    find_monitored(&state, &id).map(|m| Json(MonitoredRegionResponse::from(&m)))
}

/// Stop monitoring a region.
#[utoipa::path(
    delete,
    path = "/api/monitoring/{id}",
    tag = "monitoring",
    operation_id = "stopMonitoring",
    summary = "Stop monitoring a region",
    params(("id" = String, Path, description = "Region id")),
    responses(
        (status = 204, description = "Region is no longer monitored"),
        (status = 404, description = "Region is not monitored", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn stop_monitoring(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine().stop_monitoring(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Override a region's state.
#[utoipa::path(
    put,
    path = "/api/monitoring/{id}/state",
    tag = "monitoring",
    operation_id = "forceRegionState",
    summary = "Override a monitored region's state",
    description = "Records the given state without emitting entry or exit events. \
        Useful when another component already knows the occupancy.",
    params(("id" = String, Path, description = "Region id")),
    request_body = ForceStateRequest,
    responses(
        (status = 200, description = "State recorded", body = MonitoredRegionResponse),
        (status = 404, description = "Region is not monitored", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn force_state(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<ForceStateRequest>,
) -> ApiResult<Json<MonitoredRegionResponse>> {
    let monitored = find_monitored(&state, &id)?;
    state
        .engine()
        .force_region_state(monitored.region, Some(request.state))?;
    find_monitored(&state, &id).map(|m| Json(MonitoredRegionResponse::from(&m)))
}

fn find_monitored(state: &SharedState, id: &str) -> ApiResult<MonitoredRegion> {
    state
        .engine()
        .monitored_regions()
        .into_iter()
        .find(|m| m.region.unique_id() == id)
        .ok_or_else(|| ApiError::NotFound {
            error_code: "region_not_found".to_string(),
            message: format!("Region not monitored: '{id}'"),
        })
}
