use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connections: usize,
    pub endpoints: usize,
    pub plans: usize,
}

/// Health check endpoint
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        connections: state.hub.connection_count().await,
        endpoints: state.hub.endpoint_count().await,
        plans: state.scheduler.plan_count().await,
    })
}
