//! Packet ingestion and cycle control.
//!
//! A scanner bridge posts the advertisements it receives in batches and
//! calls `POST /api/cycle` at each scan cycle boundary, unless the server
//! runs its own cycle ticker.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use beaconwatch_core::{is_valid_mac_address, RawPacket};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the packets router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", post(submit_packets))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// One received advertisement.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "00:11:22:33:44:55",
    "rssi": -65,
    "data_hex": "0201061bff1801beac2f234454cf6d4a0fadf2f4911ba9ffa600010002c500",
    "timestamp_ms": null
}))]
pub struct PacketRequest {
    /// Transmitter MAC address.
    #[schema(example = "00:11:22:33:44:55")]
    pub address: String,

    /// Received signal strength in dBm.
    #[schema(example = -65)]
    pub rssi: i32,

    /// Raw advertisement bytes as hex.
    pub data_hex: String,

    /// Reception time in milliseconds; defaults to the server clock.
    #[serde(default)]
    #[schema(nullable)]
    pub timestamp_ms: Option<i64>,
}

/// A batch of advertisements.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PacketBatchRequest {
    /// Packets in reception order.
    pub packets: Vec<PacketRequest>,

    /// Drop packets instead of waiting when every worker is busy.
    #[serde(default)]
    #[schema(example = false)]
    pub drop_when_busy: bool,
}

/// Outcome of a packet batch.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "accepted": 12, "dropped": 0 }))]
pub struct PacketBatchResponse {
    /// Packets queued for parsing.
    pub accepted: usize,
    /// Packets discarded because the workers were saturated.
    pub dropped: usize,
}

/// Outcome of a cycle end.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "regions_ranged": 1,
    "beacons_reported": 3,
    "regions_exited": ["lobby"]
}))]
pub struct CycleResponse {
    /// Ranged regions that received a snapshot.
    pub regions_ranged: usize,
    /// Beacons reported across all snapshots.
    pub beacons_reported: usize,
    /// Monitored regions vacated at this boundary.
    pub regions_exited: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit received advertisements.
#[utoipa::path(
    post,
    path = "/api/packets",
    tag = "packets",
    operation_id = "submitPackets",
    summary = "Submit received advertisements",
    description = "Queues a batch of raw advertisements for parsing. The whole batch \
        is rejected if any packet has an invalid address or payload.",
    request_body = PacketBatchRequest,
    responses(
        (status = 200, description = "Packets queued", body = PacketBatchResponse),
        (status = 400, description = "Invalid packet", body = crate::api::error::ErrorResponse),
        (status = 503, description = "Server is shutting down", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn submit_packets(
    State(state): State<SharedState>,
    Json(request): Json<PacketBatchRequest>,
) -> ApiResult<Json<PacketBatchResponse>> {
    let now_ms = state.engine().now_millis();
    let packets = request
        .packets
        .into_iter()
        .enumerate()
        .map(|(index, packet)| to_raw_packet(index, packet, now_ms))
        .collect::<ApiResult<Vec<_>>>()?;

    let pipeline = state.pipeline();
    let mut accepted = 0;
    let mut dropped = 0;
    for packet in packets {
        if request.drop_when_busy {
            if pipeline.try_submit(packet).await? {
                accepted += 1;
            } else {
                dropped += 1;
            }
        } else {
            pipeline.submit(packet).await?;
            accepted += 1;
        }
    }
    debug!(accepted, dropped, "Packet batch queued");

    Ok(Json(PacketBatchResponse { accepted, dropped }))
}

/// End the current scan cycle.
#[utoipa::path(
    post,
    path = "/api/cycle",
    tag = "packets",
    operation_id = "endCycle",
    summary = "End the current scan cycle",
    description = "Waits for queued packets, then publishes ranging snapshots for \
        every ranged region and evaluates monitored regions for exits.",
    responses(
        (status = 200, description = "Cycle finalized", body = CycleResponse),
        (status = 503, description = "Server is shutting down", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn end_cycle(State(state): State<SharedState>) -> ApiResult<Json<CycleResponse>> {
    let report = state.pipeline().end_cycle().await?;
    Ok(Json(CycleResponse {
        regions_ranged: report.ranging.len(),
        beacons_reported: report.beacon_count(),
        regions_exited: report
            .exits
            .iter()
            .map(|exit| exit.region.unique_id().to_string())
            .collect(),
    }))
}

fn to_raw_packet(index: usize, packet: PacketRequest, now_ms: i64) -> ApiResult<RawPacket> {
    if !is_valid_mac_address(&packet.address) {
        return Err(invalid_packet(
            index,
            format!("Invalid Bluetooth address: '{}'", packet.address),
        ));
    }
    let timestamp_ms = packet.timestamp_ms.unwrap_or(now_ms);
    RawPacket::from_hex(packet.address, packet.rssi, &packet.data_hex, timestamp_ms)
        .ok_or_else(|| invalid_packet(index, "Packet data must be non-empty, even-length hex".into()))
}

fn invalid_packet(index: usize, message: String) -> ApiError {
    ApiError::BadRequest {
        error_code: "invalid_packet".to_string(),
        message,
        details: Some(serde_json::json!({ "index": index })),
    }
}
