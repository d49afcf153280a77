//! OpenAPI specification generation for the beaconwatch API.
//!
//! The generated document is served at `/api/openapi.json` and written to the
//! workspace root by the `gen-openapi` binary for client generation.

use axum::Json;
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::events::EventEntry;
use super::health::HealthResponse;
use super::layouts::{LayoutRequest, LayoutResponse};
use super::monitoring::{ForceStateRequest, MonitorRegionRequest, MonitoredRegionResponse};
use super::packets::{CycleResponse, PacketBatchRequest, PacketBatchResponse, PacketRequest};
use super::ranging::{BeaconSnapshot, RangedRegionResponse, RegionRequest, RegionResponse};
use super::system::{PersistenceRequest, PersistenceResponse, SystemStatusResponse};
use beaconwatch_core::stats::DetectionSample;
use beaconwatch_core::{PacketCounters, RegionState};

/// Serve the OpenAPI specification as JSON.
///
/// This endpoint is available at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a pretty-printed string.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for beaconwatch.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "beaconwatch API",
        version = "0.1.0",
        description = r#"
# beaconwatch API

beaconwatch turns raw Bluetooth LE advertisements into beacon sightings,
per-region ranging snapshots and debounced region enter/exit events.

## Overview

1. **Packets**: a scanner bridge posts raw advertisements and marks scan cycle boundaries
2. **Ranging**: each ranged region receives the beacons seen during the last cycle
3. **Monitoring**: monitored regions report entry on the first matching sighting and exit
   after a silent exit period
4. **Layouts**: the beacon formats the parser recognises

Region transitions and ranging results are recorded in a bounded event history.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local beaconwatch server")
    ),
    tags(
        (name = "system", description = "Health checks, status and persistence"),
        (name = "packets", description = "Advertisement ingestion and scan cycles"),
        (name = "ranging", description = "Per-cycle beacon snapshots for regions"),
        (name = "monitoring", description = "Region occupancy with debounced exits"),
        (name = "layouts", description = "Beacon formats recognised by the parser"),
        (name = "events", description = "Recent ranging results and region transitions")
    ),
    paths(
        super::health::health_check,
        super::packets::submit_packets,
        super::packets::end_cycle,
        super::ranging::list_ranging,
        super::ranging::get_ranging,
        super::ranging::start_ranging,
        super::ranging::stop_ranging,
        super::monitoring::list_monitoring,
        super::monitoring::get_monitoring,
        super::monitoring::start_monitoring,
        super::monitoring::stop_monitoring,
        super::monitoring::force_state,
        super::layouts::list_layouts,
        super::layouts::register_layout,
        super::layouts::remove_layout,
        super::events::recent_events,
        super::system::get_status,
        super::system::set_persistence,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            PacketRequest,
            PacketBatchRequest,
            PacketBatchResponse,
            CycleResponse,
            RegionRequest,
            RegionResponse,
            BeaconSnapshot,
            RangedRegionResponse,
            MonitorRegionRequest,
            MonitoredRegionResponse,
            ForceStateRequest,
            RegionState,
            LayoutRequest,
            LayoutResponse,
            EventEntry,
            SystemStatusResponse,
            PacketCounters,
            DetectionSample,
            PersistenceRequest,
            PersistenceResponse,
        )
    )
)]
pub struct ApiDoc;
