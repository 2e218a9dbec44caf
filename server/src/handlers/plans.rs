use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use common::models::{Plan, PlanExecution, PlanState};

use super::{ErrorResponse, SuccessResponse};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PlanView {
    pub plan: Plan,
    pub state: PlanState,
    pub firings: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanStateView {
    pub id: String,
    pub state: PlanState,
}

/// Create or replace a plan. A plan with a malformed trigger is stored disabled.
#[tracing::instrument(skip(state, plan), fields(plan_id = %plan.id))]
pub async fn upsert_plan(
    State(state): State<AppState>,
    Json(plan): Json<Plan>,
) -> SuccessResponse<PlanStateView> {
    let id = plan.id.clone();
    let plan_state = state.scheduler.upsert_plan(plan).await;
    SuccessResponse::new(PlanStateView {
        id,
        state: plan_state,
    })
}

#[tracing::instrument(skip(state))]
pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<PlanView>, ErrorResponse> {
    let scheduler = &state.scheduler;
    let (Some(plan), Some(plan_state)) = (scheduler.plan(&id).await, scheduler.plan_state(&id).await)
    else {
        return Err(ErrorResponse::not_found(format!("plan {} not found", id)));
    };

    Ok(SuccessResponse::new(PlanView {
        plan,
        state: plan_state,
        firings: scheduler.firing_count(&id).await.unwrap_or(0),
        last_error: scheduler.last_error(&id).await.map(|e| e.to_string()),
    }))
}

#[tracing::instrument(skip(state))]
pub async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<Plan>, ErrorResponse> {
    state
        .scheduler
        .remove_plan(&id)
        .await
        .map(SuccessResponse::new)
        .ok_or_else(|| ErrorResponse::not_found(format!("plan {} not found", id)))
}

#[tracing::instrument(skip(state))]
pub async fn enable_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<PlanStateView>, ErrorResponse> {
    set_enabled(state, id, true).await
}

#[tracing::instrument(skip(state))]
pub async fn disable_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<PlanStateView>, ErrorResponse> {
    set_enabled(state, id, false).await
}

async fn set_enabled(
    state: AppState,
    id: String,
    enabled: bool,
) -> Result<SuccessResponse<PlanStateView>, ErrorResponse> {
    let plan_state = state.scheduler.set_enabled(&id, enabled).await?;
    Ok(SuccessResponse::new(PlanStateView {
        id,
        state: plan_state,
    }))
}

/// Execution history of a plan, oldest first
#[tracing::instrument(skip(state))]
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<Vec<PlanExecution>>, ErrorResponse> {
    if state.scheduler.plan_state(&id).await.is_none() {
        return Err(ErrorResponse::not_found(format!("plan {} not found", id)));
    }
    Ok(SuccessResponse::new(state.scheduler.executions_for(&id).await?))
}
