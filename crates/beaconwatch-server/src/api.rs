//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `packets` - Advertisement ingestion and cycle boundaries
//! - `ranging` - Ranged regions and their latest snapshots
//! - `monitoring` - Monitored regions and their occupancy
//! - `layouts` - Beacon layout registry
//! - `events` - Recent event history
//! - `health` - Service health checks
//! - `system` - Status and persistence switch
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod error;
pub mod events;
pub mod health;
pub mod layouts;
pub mod monitoring;
pub mod openapi;
pub mod packets;
pub mod ranging;
pub mod system;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /packets           - Advertisement ingestion
/// ├── /cycle             - Scan cycle boundary
/// ├── /ranging           - Ranged regions and snapshots
/// ├── /monitoring        - Monitored regions and states
/// ├── /layouts           - Layout registry
/// ├── /events            - Recent events
/// ├── /system            - Status and persistence
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    // Initialize server start time for uptime tracking
    system::init_start_time();

    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/cycle", post(packets::end_cycle))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/packets", packets::router())
                .nest("/ranging", ranging::router())
                .nest("/monitoring", monitoring::router())
                .nest("/layouts", layouts::router())
                .nest("/events", events::router())
                .nest("/system", system::router()),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Router over a fresh state with persistence off and its state file in a
/// temporary directory, which must outlive the server.
#[cfg(test)]
pub(crate) fn test_server() -> (axum_test::TestServer, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = beaconwatch_core::Config::default();
    config.monitoring.persistence_enabled = false;
    config.monitoring.state_path = Some(dir.path().join("monitoring_status.json"));
    config.server.worker_threads = 2;
    let state = crate::state::AppState::new(config).unwrap();
    let server = axum_test::TestServer::new(create_router(state)).unwrap();
    (server, dir)
}
