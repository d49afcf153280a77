//! System API endpoints.
//!
//! Provides endpoints for system status and the monitoring persistence switch.

use axum::extract::State;
use axum::routing::{get, put};
use axum::{Json, Router};
use beaconwatch_core::stats::DetectionSample;
use beaconwatch_core::PacketCounters;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the system router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/persistence", put(set_persistence))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// System status response.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({
    "version": "0.1.0",
    "uptime_secs": 3600,
    "workers": 4,
    "counters": { "packets_processed": 1200, "beacon_packets": 900, "non_beacon_packets": 300 },
    "distinct_packets_detected_per_scan": true,
    "last_detection_ms": 1_700_000_000_000_i64,
    "persistence_enabled": true,
    "ranged_regions": 1,
    "monitored_regions": 2,
    "layouts": 1,
    "detection_samples": []
}))]
pub struct SystemStatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Server uptime in seconds.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Packets parsed concurrently.
    pub workers: usize,

    /// Packet counters since startup.
    pub counters: PacketCounters,

    /// Whether the scanner reports repeated packets within one scan.
    pub distinct_packets_detected_per_scan: bool,

    /// Time of the most recent beacon detection.
    #[schema(nullable)]
    pub last_detection_ms: Option<i64>,

    /// Whether monitoring state survives restarts.
    pub persistence_enabled: bool,

    /// Regions being ranged.
    pub ranged_regions: usize,

    /// Regions being monitored.
    pub monitored_regions: usize,

    /// Registered layouts.
    pub layouts: usize,

    /// Detection statistics per sampling interval, oldest first.
    pub detection_samples: Vec<DetectionSample>,
}

/// Request body for the persistence switch.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "enabled": false }))]
pub struct PersistenceRequest {
    /// Persist monitoring state across restarts.
    pub enabled: bool,
}

/// Persistence switch response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "enabled": false }))]
pub struct PersistenceResponse {
    /// Whether monitoring state is now persisted.
    pub enabled: bool,
}

// ============================================================================
// Static state for uptime tracking
// ============================================================================

use std::sync::OnceLock;
use std::time::Instant;

static SERVER_START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the server start time. Call this once at startup.
pub fn init_start_time() {
    SERVER_START_TIME.get_or_init(Instant::now);
}

/// Get server uptime in seconds.
fn get_uptime_secs() -> u64 {
    SERVER_START_TIME
        .get()
        .map_or(0, |start| start.elapsed().as_secs())
}

// ============================================================================
// Handlers
// ============================================================================

/// Get system status.
#[utoipa::path(
    get,
    path = "/api/system/status",
    tag = "system",
    operation_id = "getSystemStatus",
    summary = "Get system status",
    description = "Returns version, uptime, worker count, packet counters and \
        detection statistics.",
    responses(
        (status = 200, description = "System status retrieved", body = SystemStatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<SystemStatusResponse>> {
    let engine = state.engine();

    Ok(Json(SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime_secs(),
        workers: state.pipeline().workers(),
        counters: engine.counters(),
        distinct_packets_detected_per_scan: engine.distinct_packets_detected_per_scan(),
        last_detection_ms: engine.last_detection_ms(),
        persistence_enabled: engine.is_persistence_enabled(),
        ranged_regions: engine.ranged_regions().len(),
        monitored_regions: engine.monitored_regions().len(),
        layouts: engine.layouts().len(),
        detection_samples: engine.detection_samples(),
    }))
}

/// Switch monitoring persistence.
#[utoipa::path(
    put,
    path = "/api/system/persistence",
    tag = "system",
    operation_id = "setPersistence",
    summary = "Switch monitoring persistence",
    description = "Disabling persistence deletes the stored monitoring state. \
        Enabling it saves the current state immediately.",
    request_body = PersistenceRequest,
    responses(
        (status = 200, description = "Persistence switched", body = PersistenceResponse)
    )
)]
pub async fn set_persistence(
    State(state): State<SharedState>,
    Json(request): Json<PersistenceRequest>,
) -> Json<PersistenceResponse> {
    state.engine().set_persistence_enabled(request.enabled);
    Json(PersistenceResponse {
        enabled: state.engine().is_persistence_enabled(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server;
    use serde_json::json;

    #[test]
    fn test_system_status_response_serialization() {
        let response = SystemStatusResponse {
            version: "0.1.0".to_string(),
            uptime_secs: 3600,
            workers: 2,
            counters: PacketCounters::default(),
            distinct_packets_detected_per_scan: false,
            last_detection_ms: None,
            persistence_enabled: false,
            ranged_regions: 0,
            monitored_regions: 0,
            layouts: 1,
            detection_samples: Vec::new(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"version\":\"0.1.0\""));
        assert!(json.contains("\"packets_processed\":0"));
    }

    #[tokio::test]
    async fn test_status_and_persistence_switch() {
        let (server, _dir) = test_server();
        let status: serde_json::Value = server.get("/api/system/status").await.json();
        assert_eq!(status["workers"], 2);
        assert_eq!(status["persistence_enabled"], false);
        assert_eq!(status["layouts"], 1);

        let body: PersistenceResponse = server
            .put("/api/system/persistence")
            .json(&json!({ "enabled": true }))
            .await
            .json();
        assert!(body.enabled);
    }
}
