pub mod connection;
pub mod feed;
pub mod health;
pub mod messages;
pub mod plans;
pub mod sse;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::errors::ApiError;
use serde::Serialize;

/// JSON error body with a status derived from the error code
#[derive(Debug)]
pub struct ErrorResponse(pub ApiError);

impl ErrorResponse {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self(ApiError::new("NOT_FOUND", message))
    }
}

impl<E: Into<ApiError>> From<E> for ErrorResponse {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.0.code.as_str() {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONFIGURATION_ERROR" | "SCHEDULE_ERROR" | "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "HUB_ERROR" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self.0)).into_response()
    }
}

/// Standard API success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for SuccessResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
