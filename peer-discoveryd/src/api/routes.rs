use std::collections::HashMap;
use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use peer_discovery::AnnouncerState;
use shared::protocol::API_PREFIX;
use shared::types::{PeerEntry, ServiceRecord};
use crate::view_manager::ViewHandle;

#[derive(Clone)]
pub struct AppState {
    pub view: ViewHandle,
    pub hash_rx: watch::Receiver<String>,
    pub record: Arc<ServiceRecord>,
    pub announcer_state: watch::Receiver<AnnouncerState>,
}

#[derive(Serialize)]
pub struct SelfResponse {
    pub instance: String,
    pub service_type: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    pub state: AnnouncerState,
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/self", get(get_self))
        .route("/peers", get(get_peers))
        .route("/peers/hash", get(get_hash))
        .route("/peers/:instance", get(get_peer));

    Router::new().nest(API_PREFIX, routes).with_state(state)
}

async fn get_self(State(state): State<AppState>) -> Json<SelfResponse> {
    let state_now = *state.announcer_state.borrow();
    Json(SelfResponse {
        instance: state.record.instance.clone(),
        service_type: state.record.service_type.clone(),
        port: state.record.port,
        metadata: state.record.metadata.clone(),
        state: state_now,
    })
}

async fn get_peers(State(state): State<AppState>) -> Result<Json<Vec<PeerEntry>>, StatusCode> {
    state
        .view
        .get_all()
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to query peers: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_peer(
    State(state): State<AppState>,
    Path(instance): Path<String>,
) -> Result<Json<PeerEntry>, StatusCode> {
    state
        .view
        .get_one(instance)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query peer: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
