use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::cargo;
use crate::db::services;
use crate::error::AppError;
use crate::http_server::AppState;
use crate::lifecycle::UpdateServerRequest;
use crate::models::{Allocation, CargoFile, PowerAction};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServerRequest {
    pub server_id: String,
    pub validation_token: String,
    pub name: String,
    pub memory_limit: i64,
    pub cpu_limit: f64,
    pub allocation: Allocation,
}

pub fn servers_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_server).get(list_servers))
        .route(
            "/{id}",
            get(get_server).patch(update_server).delete(delete_server),
        )
        .route("/{id}/reinstall", post(reinstall_server))
        .route("/{id}/cargo/ship", post(ship_cargo))
        .route("/{id}/power/{action}", post(power_action))
}

/// POST /servers: accepted immediately; installation continues in the
/// background.
async fn create_server(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateServerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let record = state
        .manager
        .create_server(
            &payload.server_id,
            &payload.validation_token,
            &payload.name,
            payload.memory_limit,
            payload.cpu_limit,
            &payload.allocation,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": record.id,
            "name": record.name,
            "state": "installing",
            "validationToken": payload.validation_token,
        })),
    ))
}

async fn list_servers(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let servers = services::list_servers(&state.manager.db).await?;
    Ok(Json(servers))
}

/// GET /servers/:id returns the record, augmented with the live engine
/// status and the current console ring.
async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = services::require_server(&state.manager.db, &id).await?;
    let status = state.manager.live_status(&record).await;
    let logs = state.manager.rings.snapshot(&id);

    let mut body = serde_json::to_value(&record)?;
    if let Some(object) = body.as_object_mut() {
        object.insert("status".to_string(), json!(status));
        object.insert("logs".to_string(), json!(logs));
    }
    Ok(Json(body))
}

async fn update_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateServerRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(body_id) = &payload.server_id {
        if body_id != &id {
            return Err(AppError::BadRequest(format!(
                "body server id '{body_id}' does not match path '{id}'"
            )));
        }
    }
    let server = state.manager.update_server(&id, &payload).await?;
    Ok(Json(json!({ "message": "server updated", "server": server })))
}

async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.manager.delete_server(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reinstall_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.manager.reinstall_server(&id).await?;
    Ok(Json(json!({ "message": "reinstall started" })))
}

/// POST /servers/:id/cargo/ship fetches the listed cargo into the server's
/// volume and folds the entries into the persisted manifest.
async fn ship_cargo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<impl IntoResponse, AppError> {
    let cargo_value = payload
        .get("cargo")
        .cloned()
        .ok_or_else(|| AppError::BadRequest("missing 'cargo' list".to_string()))?;
    let entries: Vec<CargoFile> = serde_json::from_value(cargo_value)
        .map_err(|e| AppError::BadRequest(format!("malformed cargo list: {e}")))?;

    let record = services::require_server(&state.manager.db, &id).await?;
    let volume_dir = state.manager.volume_dir(&id);
    tokio::fs::create_dir_all(&volume_dir).await?;
    cargo::ship_cargo(&state.manager.http, &volume_dir, &entries).await?;

    let mut doc = record.config_doc();
    for entry in entries {
        doc.cargo.retain(|existing| existing.target_path != entry.target_path);
        doc.cargo.push(entry);
    }
    services::update_config_doc(&state.manager.db, &id, &doc).await?;

    Ok(Json(json!({ "message": "cargo shipped" })))
}

async fn power_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let action = PowerAction::from_str(&action)
        .map_err(|_| AppError::BadRequest(format!("unknown power action '{action}'")))?;
    let new_state = state.manager.power_action(&id, action).await?;
    Ok(Json(json!({
        "message": format!("server is now {new_state}")
    })))
}
