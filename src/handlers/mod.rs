mod stats;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use log::info;
use serde_json::json;

use crate::error::AppError;
use crate::fanout::ObserverHub;
use crate::gateway::VoteGateway;
use crate::models::VoteRequest;
use crate::telemetry::Health;

pub struct AppState {
    pub gateway: Arc<VoteGateway>,
    pub hub: Arc<ObserverHub>,
    pub health: Arc<Health>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/vote", post(vote_handler))
        .route("/health", get(health_handler))
        .route("/poll-stats", get(stats::poll_stats_handler))
        .with_state(state)
}

// Acknowledges that the vote was queued, not that it is counted yet.
pub async fn vote_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload.map_err(|rejection| {
        info!("Rejected vote payload: {}", rejection);
        AppError::MalformedPayload
    })?;

    state.gateway.submit(request).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "Vote queued" }))))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let degraded = state.health.degraded();
    if degraded.is_empty() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "degraded": degraded })),
        )
    }
}
