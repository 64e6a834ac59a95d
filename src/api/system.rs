//! Liveness and readiness endpoints.
use crate::app::AppState;
use axum::extract::State;

pub async fn health(State(state): State<AppState>) -> String {
    state.server_id.clone()
}

pub async fn readiness(State(state): State<AppState>) -> String {
    state.server_id.clone()
}
