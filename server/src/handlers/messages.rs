use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use common::models::{MessageRecord, Realm, SendReceipt};

use super::{ErrorResponse, SuccessResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub provider: String,
    #[serde(alias = "message")]
    pub realm: Realm,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// Send a message through a provider and return its receipt
#[tracing::instrument(skip(state, request), fields(provider = %request.provider))]
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<SuccessResponse<SendReceipt>, ErrorResponse> {
    let receipt = state.dispatch.send(&request.provider, request.realm).await?;
    Ok(SuccessResponse::new(receipt))
}

#[tracing::instrument(skip(state))]
pub async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<SuccessResponse<MessageRecord>, ErrorResponse> {
    state
        .dispatch
        .message(id)
        .await?
        .map(SuccessResponse::new)
        .ok_or_else(|| ErrorResponse::not_found(format!("message {} not found", id)))
}

/// Most recent messages, newest first
#[tracing::instrument(skip(state))]
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<SuccessResponse<Vec<MessageRecord>>, ErrorResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(SuccessResponse::new(state.dispatch.recent_messages(limit).await?))
}
