//! Ranging API endpoints.
//!
//! Ranged regions receive a snapshot of matching beacons at every cycle end.
//! The latest snapshot of each region is served from the event log.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use beaconwatch_core::{Identifier, RegionCriteria, Sighting};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the ranging router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(list_ranging)).route(
        "/{id}",
        get(get_ranging).put(start_ranging).delete(stop_ranging),
    )
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Region criteria as supplied by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identifiers": ["2f234454-cf6d-4a0f-adf2-f4911ba9ffa6", "1", null],
    "bluetooth_address": null
}))]
pub struct RegionRequest {
    /// Identifier slots in order; `null` matches anything.
    #[serde(default)]
    pub identifiers: Vec<Option<String>>,

    /// Restricts the region to one transmitter.
    #[serde(default)]
    #[schema(nullable, example = "00:11:22:33:44:55")]
    pub bluetooth_address: Option<String>,
}

impl RegionRequest {
    /// Builds core criteria named `unique_id`.
    ///
    /// # Errors
    ///
    /// Returns a 400 error for unparsable identifiers or a bad address.
    pub fn into_criteria(self, unique_id: &str) -> ApiResult<RegionCriteria> {
        let identifiers = self
            .identifiers
            .iter()
            .map(|slot| slot.as_deref().map(Identifier::parse).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        let region = RegionCriteria::new(unique_id, identifiers)?;
        Ok(match self.bluetooth_address {
            Some(address) => region.with_address(address)?,
            None => region,
        })
    }
}

/// A region as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "unique_id": "lobby",
    "identifiers": ["2f234454-cf6d-4a0f-adf2-f4911ba9ffa6", "1", null],
    "bluetooth_address": null
}))]
pub struct RegionResponse {
    /// Region id.
    #[schema(example = "lobby")]
    pub unique_id: String,

    /// Identifier slots in display form.
    pub identifiers: Vec<Option<String>>,

    /// Transmitter restriction, if any.
    #[schema(nullable)]
    pub bluetooth_address: Option<String>,
}

impl From<&RegionCriteria> for RegionResponse {
    fn from(region: &RegionCriteria) -> Self {
        Self {
            unique_id: region.unique_id().to_string(),
            identifiers: region
                .identifiers()
                .iter()
                .map(|slot| slot.as_ref().map(ToString::to_string))
                .collect(),
            bluetooth_address: region.bluetooth_address().map(str::to_string),
        }
    }
}

/// One beacon in a ranging snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identifiers": ["2f234454-cf6d-4a0f-adf2-f4911ba9ffa6", "1", "2"],
    "hardware_address": "00:11:22:33:44:55",
    "layout_id": "altbeacon",
    "beacon_type_code": 48812,
    "manufacturer": 280,
    "service_uuid": null,
    "rssi": -63,
    "tx_power": -59,
    "running_average_rssi": -64.5,
    "distance": 1.42,
    "measurement_count": 4,
    "packet_count": 4,
    "data_fields": [0],
    "extra_data_fields": [],
    "name": null,
    "first_cycle_detection_ms": 1_700_000_000_000_i64,
    "last_cycle_detection_ms": 1_700_000_001_000_i64
}))]
pub struct BeaconSnapshot {
    /// Identifiers in display form.
    pub identifiers: Vec<String>,
    /// Transmitter MAC address.
    pub hardware_address: String,
    /// Layout that matched.
    pub layout_id: String,
    /// Matched type code.
    pub beacon_type_code: u64,
    /// Manufacturer id from the advertisement.
    pub manufacturer: u16,
    /// Service UUID for service data beacons.
    #[schema(nullable)]
    pub service_uuid: Option<u16>,
    /// RSSI of the latest packet.
    pub rssi: i32,
    /// Calibrated power at one meter.
    pub tx_power: i32,
    /// Smoothed RSSI over the sample window.
    #[schema(nullable)]
    pub running_average_rssi: Option<f64>,
    /// Estimated distance in meters.
    #[schema(nullable)]
    pub distance: Option<f64>,
    /// Samples behind the smoothed RSSI.
    pub measurement_count: u32,
    /// Packets received this cycle.
    pub packet_count: u32,
    /// Data fields in layout order.
    pub data_fields: Vec<u64>,
    /// Data fields merged from an auxiliary frame.
    pub extra_data_fields: Vec<u64>,
    /// Advertised device name.
    #[schema(nullable)]
    pub name: Option<String>,
    /// First detection in the cycle.
    pub first_cycle_detection_ms: i64,
    /// Latest detection in the cycle.
    pub last_cycle_detection_ms: i64,
}

impl From<&Sighting> for BeaconSnapshot {
    fn from(sighting: &Sighting) -> Self {
        Self {
            identifiers: sighting.identifiers().iter().map(ToString::to_string).collect(),
            hardware_address: sighting.hardware_address().to_string(),
            layout_id: sighting.layout_id().to_string(),
            beacon_type_code: sighting.beacon_type_code(),
            manufacturer: sighting.manufacturer(),
            service_uuid: sighting.service_uuid(),
            rssi: sighting.rssi(),
            tx_power: sighting.tx_power(),
            running_average_rssi: sighting.running_average_rssi(),
            distance: sighting.distance(),
            measurement_count: sighting.measurement_count(),
            packet_count: sighting.packet_count(),
            data_fields: sighting.data_fields().to_vec(),
            extra_data_fields: sighting.extra_data_fields().to_vec(),
            name: sighting.name().map(str::to_string),
            first_cycle_detection_ms: sighting.first_cycle_detection_ms(),
            last_cycle_detection_ms: sighting.last_cycle_detection_ms(),
        }
    }
}

/// A ranged region with its latest snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RangedRegionResponse {
    /// The ranged region.
    pub region: RegionResponse,

    /// Beacons reported at the latest cycle end.
    pub beacons: Vec<BeaconSnapshot>,

    /// When that cycle ended; absent before the first cycle.
    #[schema(nullable, example = "2025-01-15T03:30:00Z")]
    pub updated_at_utc: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List ranged regions.
#[utoipa::path(
    get,
    path = "/api/ranging",
    tag = "ranging",
    operation_id = "listRanging",
    summary = "List ranged regions",
    description = "Returns every ranged region with the beacons reported at the latest cycle end.",
    responses(
        (status = 200, description = "Ranged regions", body = Vec<RangedRegionResponse>)
    )
)]
pub async fn list_ranging(State(state): State<SharedState>) -> Json<Vec<RangedRegionResponse>> {
    let regions = state
        .engine()
        .ranged_regions()
        .iter()
        .map(|region| ranged_region_response(&state, region))
        .collect();
    Json(regions)
}

/// Get one ranged region.
#[utoipa::path(
    get,
    path = "/api/ranging/{id}",
    tag = "ranging",
    operation_id = "getRanging",
    summary = "Get a ranged region",
    params(("id" = String, Path, description = "Region id")),
    responses(
        (status = 200, description = "Ranged region", body = RangedRegionResponse),
        (status = 404, description = "Region is not ranged", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_ranging(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RangedRegionResponse>> {
    state
        .engine()
        .ranged_regions()
        .iter()
        .find(|region| region.unique_id() == id)
        .map(|region| Json(ranged_region_response(&state, region)))
        .ok_or_else(|| not_ranged(&id))
}

/// Start ranging a region.
#[utoipa::path(
    put,
    path = "/api/ranging/{id}",
    tag = "ranging",
    operation_id = "startRanging",
    summary = "Start ranging a region",
    description = "Starts ranging the region. Re-sending the same identifiers keeps the \
        accumulated beacons; different identifiers restart the region.",
    params(("id" = String, Path, description = "Region id")),
    request_body = RegionRequest,
    responses(
        (status = 200, description = "Region is ranged", body = RegionResponse),
        (status = 400, description = "Invalid region", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn start_ranging(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<RegionRequest>,
) -> ApiResult<Json<RegionResponse>> {
    let region = request.into_criteria(&id)?;
    let response = RegionResponse::from(&region);
    state.engine().start_ranging(region)?;
    Ok(Json(response))
}

/// Stop ranging a region.
#[utoipa::path(
    delete,
    path = "/api/ranging/{id}",
    tag = "ranging",
    operation_id = "stopRanging",
    summary = "Stop ranging a region",
    params(("id" = String, Path, description = "Region id")),
    responses(
        (status = 204, description = "Region is no longer ranged"),
        (status = 404, description = "Region is not ranged", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn stop_ranging(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine().stop_ranging(&id)?;
    state.events().forget_ranging(&id);
    Ok(StatusCode::NO_CONTENT)
}

fn ranged_region_response(state: &SharedState, region: &RegionCriteria) -> RangedRegionResponse {
    let snapshot = state.events().ranging(region.unique_id());
    RangedRegionResponse {
        region: RegionResponse::from(region),
        beacons: snapshot
            .as_ref()
            .map(|s| s.beacons.iter().map(BeaconSnapshot::from).collect())
            .unwrap_or_default(),
        updated_at_utc: snapshot.map(|s| s.updated_at_utc.to_rfc3339()),
    }
}

fn not_ranged(id: &str) -> ApiError {
    ApiError::NotFound {
        error_code: "region_not_found".to_string(),
        message: format!("Region not ranged: '{id}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server;
    use serde_json::json;

    #[test]
    fn test_region_request_parses_identifiers() {
        let request = RegionRequest {
            identifiers: vec![
                Some("2f234454-cf6d-4a0f-adf2-f4911ba9ffa6".into()),
                Some("1".into()),
                None,
            ],
            bluetooth_address: Some("00:11:22:33:44:55".into()),
        };
        let region = request.into_criteria("lobby").unwrap();
        let response = RegionResponse::from(&region);
        assert_eq!(response.unique_id, "lobby");
        assert_eq!(
            response.identifiers,
            vec![
                Some("2f234454-cf6d-4a0f-adf2-f4911ba9ffa6".to_string()),
                Some("1".to_string()),
                None
            ]
        );
        assert_eq!(response.bluetooth_address.as_deref(), Some("00:11:22:33:44:55"));
    }

    #[test]
    fn test_region_request_rejects_bad_address() {
        let request = RegionRequest {
            identifiers: Vec::new(),
            bluetooth_address: Some("nope".into()),
        };
        assert!(matches!(
            request.into_criteria("lobby"),
            Err(ApiError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_ranging_lifecycle() {
        let (server, _dir) = test_server();
        server
            .put("/api/ranging/desk")
            .json(&json!({ "identifiers": [null, "1"] }))
            .await
            .assert_status_ok();

        let regions: Vec<RangedRegionResponse> = server.get("/api/ranging").await.json();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].region.unique_id, "desk");
        assert!(regions[0].updated_at_utc.is_none());

        server.post("/api/cycle").await.assert_status_ok();
        let region: RangedRegionResponse = server.get("/api/ranging/desk").await.json();
        assert!(region.beacons.is_empty());
        assert!(region.updated_at_utc.is_some());

        server
            .delete("/api/ranging/desk")
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server.get("/api/ranging/desk").await.assert_status_not_found();
        server.delete("/api/ranging/desk").await.assert_status_not_found();
    }

    #[tokio::test]
    async fn test_invalid_identifier_is_rejected() {
        let (server, _dir) = test_server();
        let response = server
            .put("/api/ranging/desk")
            .json(&json!({ "identifiers": ["not an identifier"] }))
            .await;
        response.assert_status_bad_request();
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "invalid_identifier");
    }
}
