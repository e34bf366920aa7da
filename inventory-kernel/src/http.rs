/**
 * API REST INVENTORY - Serveur HTTP du synchroniseur
 *
 * ROLE :
 * Thin operator surface over the orchestrator and the device store.
 * No business logic here: every route maps to one orchestrator call.
 *
 * ROUTES :
 * - GET  /health                      (sans auth)
 * - GET  /sync/status
 * - POST /sync/manual
 * - POST /sync/unlock                 (privileged, logged)
 * - POST /sync/auto/start?interval_secs=N
 * - POST /sync/auto/stop
 * - GET  /devices, GET /devices/{id}
 *
 * SECURITE :
 * Header x-api-key obligatoire sauf /health. Without a configured key every
 * protected route answers 401.
 */

use crate::models::{DeviceRecord, SyncResult};
use crate::orchestrator::{SyncError, SyncOrchestrator, SyncStatusView};
use crate::store::SharedDeviceStore;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncOrchestrator>,
    pub store: SharedDeviceStore,
    pub api_key: Option<Arc<str>>,
    pub default_auto_interval: Duration,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("INVENTORY_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sync/status", get(sync_status))
        .route("/sync/manual", post(manual_sync))
        .route("/sync/unlock", post(force_unlock))
        .route("/sync/auto/start", post(start_auto_sync))
        .route("/sync/auto/stop", post(stop_auto_sync))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %e, "{context}");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": format!("{context}: {e}") })))
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let body = match &self {
            SyncError::LockConflict { kind, age_ms, lock_id } => json!({
                "error": "lock_conflict",
                "message": self.to_string(),
                "kind": kind,
                "ageMs": age_ms,
                "lockId": lock_id,
            }),
            SyncError::InProgress => json!({ "error": "in_progress", "message": self.to_string() }),
            SyncError::Lock(_) => json!({ "error": "lock_unavailable", "message": self.to_string() }),
        };
        let status = match self {
            SyncError::LockConflict { .. } | SyncError::InProgress => StatusCode::CONFLICT,
            SyncError::Lock(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(body)).into_response()
    }
}

// GET /sync/status
async fn sync_status(State(app): State<AppState>) -> Result<Json<SyncStatusView>, (StatusCode, Json<serde_json::Value>)> {
    app.sync
        .sync_status()
        .await
        .map(Json)
        .map_err(|e| internal_error("cannot read sync status", e))
}

// POST /sync/manual
async fn manual_sync(State(app): State<AppState>) -> Result<(StatusCode, Json<SyncResult>), SyncError> {
    let result = app.sync.manual_sync().await?;
    let status = if result.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
    Ok((status, Json(result)))
}

// POST /sync/unlock
async fn force_unlock(State(app): State<AppState>) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let removed = app
        .sync
        .force_unlock()
        .await
        .map_err(|e| internal_error("force unlock failed", e))?;
    Ok(Json(json!({ "released": removed.is_some(), "lock": removed })))
}

#[derive(Debug, Deserialize)]
struct AutoSyncParams {
    interval_secs: Option<u64>,
}

// POST /sync/auto/start
async fn start_auto_sync(
    State(app): State<AppState>,
    Query(params): Query<AutoSyncParams>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let interval = match params.interval_secs {
        Some(0) => {
            return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "interval_secs must be positive" }))));
        }
        Some(secs) => Duration::from_secs(secs),
        None => app.default_auto_interval,
    };
    app.sync.start_auto_sync(interval);
    Ok(Json(json!({ "running": true, "intervalSecs": interval.as_secs() })))
}

// POST /sync/auto/stop
async fn stop_auto_sync(State(app): State<AppState>) -> Json<serde_json::Value> {
    let stopped = app.sync.stop_auto_sync();
    Json(json!({ "stopped": stopped }))
}

// GET /devices
async fn list_devices(State(app): State<AppState>) -> Result<Json<Vec<DeviceRecord>>, (StatusCode, Json<serde_json::Value>)> {
    app.store
        .list()
        .await
        .map(Json)
        .map_err(|e| internal_error("cannot list devices", e))
}

// GET /devices/{id}
async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceRecord>, (StatusCode, Json<serde_json::Value>)> {
    match app.store.get(&id).await {
        Ok(Some(device)) => Ok(Json(device)),
        Ok(None) => Err((StatusCode::NOT_FOUND, Json(json!({ "error": format!("device {id} not found") })))),
        Err(e) => Err(internal_error("cannot read device", e)),
    }
}
