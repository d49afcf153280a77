//! Recent event endpoint.
//!
//! The server keeps a bounded history of engine events so clients without a
//! push channel can poll for ranging results and region transitions.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult};
use crate::state::{RecordedEvent, SharedState, EVENT_HISTORY};

const DEFAULT_LIMIT: usize = 50;

/// Creates the events router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(recent_events))
}

/// Query parameters for the events endpoint.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Maximum number of events to return, newest last. Defaults to 50.
    #[param(example = 20, minimum = 1, maximum = 256)]
    pub limit: Option<usize>,
}

/// One recorded event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "sequence": 42,
    "kind": "region_entered",
    "received_at_utc": "2025-01-15T03:30:00Z",
    "event": {
        "type": "region_entered",
        "region": { "unique_id": "lobby", "identifiers": [] },
        "target": "default"
    }
}))]
pub struct EventEntry {
    /// Monotonic sequence number; gaps mean events were evicted.
    pub sequence: u64,

    /// Event type, same as `event.type`.
    #[schema(example = "region_entered")]
    pub kind: String,

    /// When the server recorded the event.
    pub received_at_utc: String,

    /// The event payload.
    #[schema(value_type = Object)]
    pub event: serde_json::Value,
}

impl TryFrom<RecordedEvent> for EventEntry {
    type Error = serde_json::Error;

    fn try_from(recorded: RecordedEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            sequence: recorded.sequence,
            kind: recorded.event.kind().to_string(),
            received_at_utc: recorded.received_at_utc.to_rfc3339(),
            event: serde_json::to_value(&recorded.event)?,
        })
    }
}

/// Get recent events.
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "events",
    operation_id = "getRecentEvents",
    summary = "Get recent events",
    description = "Returns the most recent ranging results and region transitions, \
        oldest first. At most 256 events are retained.",
    params(EventsQuery),
    responses(
        (status = 200, description = "Recent events", body = Vec<EventEntry>),
        (status = 400, description = "Invalid limit", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn recent_events(
    State(state): State<SharedState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<EventEntry>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > EVENT_HISTORY {
        return Err(ApiError::bad_request(
            "invalid_limit",
            format!("Limit must be between 1 and {EVENT_HISTORY}"),
        ));
    }

    let entries = state
        .events()
        .recent(limit)
        .into_iter()
        .map(EventEntry::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::InternalError {
            error_code: "serialization_failed".to_string(),
            message: format!("Failed to serialize event: {e}"),
        })?;
    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_record_transitions() {
        let (server, _dir) = test_server();
        server
            .put("/api/monitoring/lobby")
            .json(&json!({}))
            .await
            .assert_status_ok();
        server
            .post("/api/packets")
            .json(&json!({
                "packets": [{
                    "address": "00:11:22:33:44:55",
                    "rssi": -60,
                    "data_hex": "0201061bff1801beac0102030405060708090a0b0c0d0e0f1000010002c500"
                }]
            }))
            .await
            .assert_status_ok();
        server.post("/api/cycle").await.assert_status_ok();

        let events: Vec<EventEntry> = server.get("/api/events").await.json();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["region_entered", "region_state_changed"]);
        assert_eq!(events[1].event["state"], "inside");
        assert!(events[0].sequence < events[1].sequence);

        let last: Vec<EventEntry> = server
            .get("/api/events")
            .add_query_param("limit", 1)
            .await
            .json();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].kind, "region_state_changed");
    }

    #[tokio::test]
    async fn test_limit_is_validated() {
        let (server, _dir) = test_server();
        server
            .get("/api/events")
            .add_query_param("limit", 0)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .get("/api/events")
            .add_query_param("limit", EVENT_HISTORY + 1)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
