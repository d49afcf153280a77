//! Layout registry endpoints.
//!
//! Layouts are tried in registration order; the first that matches a packet
//! wins. Registering a layout whose id is already known replaces it in place.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use beaconwatch_core::config::parse_layout_entry;
use beaconwatch_core::LayoutDescriptor;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the layouts router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_layouts).post(register_layout))
        .route("/{id}", delete(remove_layout))
}

/// Request body for registering a layout.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "layout": "m:2-3=0215,i:4-19,i:20-21,i:22-23,p:24-24",
    "name": "ibeacon-custom"
}))]
pub struct LayoutRequest {
    /// A layout string, or a built-in name such as `eddystone-uid`.
    pub layout: String,

    /// Name used as the layout id; defaults to the layout string.
    #[serde(default)]
    #[schema(nullable)]
    pub name: Option<String>,
}

/// A registered layout.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "altbeacon",
    "layout": "m:2-3=beac,i:4-19,i:20-21,i:22-23,p:24-24,d:25-25",
    "extra_frame": false,
    "multi_frame": false,
    "hardware_assist_manufacturers": [280]
}))]
pub struct LayoutResponse {
    /// Layout id: its name, or the layout string.
    pub id: String,
    /// Canonical layout string.
    pub layout: String,
    /// Whether this layout describes auxiliary data frames.
    pub extra_frame: bool,
    /// Whether frames of this layout carry child layouts.
    pub multi_frame: bool,
    /// Manufacturer codes accepted when hardware assist is enforced.
    pub hardware_assist_manufacturers: Vec<u16>,
}

impl From<&LayoutDescriptor> for LayoutResponse {
    fn from(layout: &LayoutDescriptor) -> Self {
        Self {
            id: layout.id(),
            layout: layout.to_string(),
            extra_frame: layout.is_extra_frame(),
            multi_frame: layout.is_multi_frame(),
            hardware_assist_manufacturers: layout.hardware_assist_manufacturers().to_vec(),
        }
    }
}

/// List registered layouts.
#[utoipa::path(
    get,
    path = "/api/layouts",
    tag = "layouts",
    operation_id = "listLayouts",
    summary = "List registered layouts",
    responses(
        (status = 200, description = "Layouts in match order", body = Vec<LayoutResponse>)
    )
)]
pub async fn list_layouts(State(state): State<SharedState>) -> Json<Vec<LayoutResponse>> {
    Json(state.engine().layouts().iter().map(LayoutResponse::from).collect())
}

/// Register a layout.
#[utoipa::path(
    post,
    path = "/api/layouts",
    tag = "layouts",
    operation_id = "registerLayout",
    summary = "Register a layout",
    description = "Validates and registers a layout. A layout with the same id is replaced.",
    request_body = LayoutRequest,
    responses(
        (status = 201, description = "Layout registered", body = LayoutResponse),
        (status = 400, description = "Invalid layout", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn register_layout(
    State(state): State<SharedState>,
    Json(request): Json<LayoutRequest>,
) -> ApiResult<(StatusCode, Json<LayoutResponse>)> {
    let mut layout = parse_layout_entry(&request.layout)?;
    if let Some(name) = request.name.filter(|n| !n.trim().is_empty()) {
        layout = layout.with_name(name);
    }
    let response = LayoutResponse::from(&layout);
    state.engine().register_layout(layout);
    Ok((StatusCode::CREATED, Json(response)))
}

/// Remove a layout.
#[utoipa::path(
    delete,
    path = "/api/layouts/{id}",
    tag = "layouts",
    operation_id = "removeLayout",
    summary = "Remove a layout",
    params(("id" = String, Path, description = "Layout id")),
    responses(
        (status = 204, description = "Layout removed"),
        (status = 404, description = "No layout with this id", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn remove_layout(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine().remove_layout(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound {
            error_code: "layout_not_found".to_string(),
            message: format!("Layout not found: '{id}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_remove_layout() {
        let (server, _dir) = test_server();
        let initial: Vec<LayoutResponse> = server.get("/api/layouts").await.json();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].id, "altbeacon");

        let response = server
            .post("/api/layouts")
            .json(&json!({ "layout": "eddystone-uid" }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: LayoutResponse = response.json();
        assert_eq!(body.id, "eddystone-uid");

        let custom: LayoutResponse = server
            .post("/api/layouts")
            .json(&json!({ "layout": "m:2-3=0215,i:4-19,i:20-21,i:22-23,p:24-24", "name": "mine" }))
            .await
            .json();
        assert_eq!(custom.id, "mine");

        let ids: Vec<String> = server
            .get("/api/layouts")
            .await
            .json::<Vec<LayoutResponse>>()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["altbeacon", "eddystone-uid", "mine"]);

        server
            .delete("/api/layouts/mine")
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server.delete("/api/layouts/mine").await.assert_status_not_found();
    }

    #[tokio::test]
    async fn test_invalid_layout_is_rejected() {
        let (server, _dir) = test_server();
        let response = server
            .post("/api/layouts")
            .json(&json!({ "layout": "q:1-2" }))
            .await;
        response.assert_status_bad_request();
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "invalid_layout");
    }
}
