//! 运维控制。
//!
//! - POST /control/rebirth
//! - POST /control/connectors/{id}/start
//! - POST /control/connectors/{id}/stop
//! - POST /control/faults/ack

use crate::AppState;
use crate::utils::response::{bad_request_error, control_error, ok};
use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub machine_id: String,
    pub code: i64,
    #[serde(default)]
    pub operator: Option<String>,
}

pub async fn force_rebirth(State(state): State<AppState>) -> Response {
    match state.control.rebirth().await {
        Ok(()) => ok(serde_json::json!({ "requested": true })),
        Err(err) => control_error(err),
    }
}

pub async fn start_connector(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
) -> Response {
    match state.control.start_connector(&connector_id) {
        Ok(()) => ok(serde_json::json!({ "connector_id": connector_id, "enabled": true })),
        Err(err) => control_error(err),
    }
}

pub async fn stop_connector(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
) -> Response {
    match state.control.stop_connector(&connector_id) {
        Ok(()) => ok(serde_json::json!({ "connector_id": connector_id, "enabled": false })),
        Err(err) => control_error(err),
    }
}

pub async fn acknowledge_fault(
    State(state): State<AppState>,
    Json(req): Json<AcknowledgeRequest>,
) -> Response {
    let machine_id = req.machine_id.trim();
    if machine_id.is_empty() {
        return bad_request_error("machine_id is required");
    }
    let operator = req
        .operator
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http");
    match state
        .control
        .acknowledge_fault(machine_id, req.code, operator)
        .await
    {
        Ok(event) => ok(event),
        Err(err) => control_error(err),
    }
}
