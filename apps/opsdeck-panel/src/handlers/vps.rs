use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::vps_manager::{NewVps, VpsError, VpsStatus, DEFAULT_AGENT_PORT};
use crate::AppState;

#[derive(Serialize)]
struct AddVpsResponse {
    success: bool,
    message: String,
    vps: AddedVps,
}

#[derive(Serialize)]
struct AddedVps {
    id: String,
    name: String,
    address: String,
    port: u16,
    status: VpsStatus,
}

/// Register a VPS and start connecting to it. The connection outcome is
/// observed on /ws, not in this response.
/// POST /api/vps/add
pub async fn add_vps(
    State(state): State<AppState>,
    Json(new): Json<NewVps>,
) -> impl IntoResponse {
    let vps_id = format!("vps_{}_{}", new.owner_id, Uuid::new_v4().simple());
    let name = new
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("VPS-{vps_id}"));
    let address = new.address.clone();
    let port = new.port.unwrap_or(DEFAULT_AGENT_PORT);

    match state.vps_manager.add_vps(&vps_id, new) {
        Ok(()) => {
            info!("VPS {} ({}) registered via API", vps_id, name);
            Json(AddVpsResponse {
                success: true,
                message: "VPS added, connecting...".to_string(),
                vps: AddedVps {
                    id: vps_id,
                    name,
                    address,
                    port,
                    status: VpsStatus::Connecting,
                },
            })
            .into_response()
        }
        Err(err @ (VpsError::MissingAddress | VpsError::MissingApiKey)) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            error!("Add VPS failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(alias = "userId")]
    pub owner_id: i64,
}

/// List the connected VPS of one owner.
/// GET /api/vps/list?owner_id=...
pub async fn list_user_vps(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let vps = state.vps_manager.get_user_vps(params.owner_id);
    Json(serde_json::json!({ "success": true, "vps": vps }))
}

/// List every connected VPS with its last stats.
/// GET /api/vps
pub async fn list_connected_vps(State(state): State<AppState>) -> impl IntoResponse {
    let vps = state.vps_manager.get_connected_vps();
    Json(serde_json::json!({ "success": true, "vps": vps }))
}

/// Info for a single VPS.
/// GET /api/vps/{id}
pub async fn get_vps(
    Path(vps_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.vps_manager.get_vps_info(&vps_id) {
        Some(info) => Json(info).into_response(),
        None => (StatusCode::NOT_FOUND, "VPS not found").into_response(),
    }
}

/// Last polled stats for a VPS.
/// GET /api/vps/{id}/stats
pub async fn get_vps_stats(
    Path(vps_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.vps_manager.get_vps_info(&vps_id) {
        Some(info) => match info.last_stats {
            Some(stats) => {
                Json(serde_json::json!({ "success": true, "stats": stats })).into_response()
            }
            None => (StatusCode::SERVICE_UNAVAILABLE, "No stats collected yet").into_response(),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "VPS not connected").into_response(),
    }
}

#[derive(Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: String,
}

/// Run a shell command on a connected VPS.
/// POST /api/vps/{id}/execute
pub async fn execute_command(
    Path(vps_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ExecuteCommandRequest>,
) -> impl IntoResponse {
    if payload.command.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Command is required").into_response();
    }
    if !state.vps_manager.is_vps_connected(&vps_id) {
        return (StatusCode::SERVICE_UNAVAILABLE, "VPS not connected").into_response();
    }

    match state
        .vps_manager
        .execute_command(&vps_id, &payload.command)
        .await
    {
        Ok(result) => {
            Json(serde_json::json!({ "success": true, "result": result })).into_response()
        }
        Err(VpsError::NotRegistered(_)) => (StatusCode::NOT_FOUND, "VPS not found").into_response(),
        Err(err) => {
            error!("Execute on VPS {} failed: {}", vps_id, err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Command failed: {}", err),
            )
                .into_response()
        }
    }
}

/// Reset the retry budget and reconnect.
/// POST /api/vps/{id}/retry
pub async fn retry_vps(
    Path(vps_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.vps_manager.retry_vps(&vps_id) {
        Ok(()) => Json(serde_json::json!({ "success": true, "message": "Reconnecting..." }))
            .into_response(),
        Err(VpsError::NotRegistered(_)) => (StatusCode::NOT_FOUND, "VPS not found").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Remove a VPS from monitoring. Idempotent.
/// DELETE /api/vps/{id}
pub async fn remove_vps(
    Path(vps_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.vps_manager.remove_vps(&vps_id);
    Json(serde_json::json!({ "success": true }))
}

/// GET /api/health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
