//! HTTP surface of the hub.
//!
//! - `GET /health`        liveness, always `ok`
//! - `GET /system/health` hub counters and engine link status
//! - `GET /snapshot`      latest merged snapshot, 404 until the first sample
//! - `GET /ws`            WebSocket push channel, one JSON object per update

use crate::broadcast::ws_handler;
use crate::health::{HealthTracker, HubHealth};
use crate::models::MergedSnapshot;
use crate::state::StateStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/snapshot", get(get_snapshot))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<HubHealth> {
    Json(app.health.get_health(&app.store))
}

// GET /snapshot
async fn get_snapshot(State(app): State<AppState>) -> Result<Json<MergedSnapshot>, StatusCode> {
    let Some(current) = app.store.read() else { return Err(StatusCode::NOT_FOUND) };
    Ok(Json(current.snapshot.clone()))
}
