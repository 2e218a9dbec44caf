// Error handling framework
//
// Per-connection delivery failures are values (`PushOutcome`), not errors.
// Everything here either rejects a single request or a single definition.

use crate::models::ProviderKind;
use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),
}

/// Errors that abort a whole dispatch (configuration errors)
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("No outbound channel registered for provider kind '{0}'")]
    NoChannel(ProviderKind),

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Whether the error belongs to the configuration class (unknown
    /// provider/channel) rather than an internal failure
    pub fn is_configuration(&self) -> bool {
        matches!(self, DispatchError::UnknownProvider(_) | DispatchError::NoChannel(_))
    }
}

/// Per-delivery framing failures for websocket providers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid provider config: {0}")]
    InvalidConfig(String),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Connection hub errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),
}

/// In-memory store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Catalog import errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match &err {
            ScheduleError::PlanNotFound(_) => ApiError::new("NOT_FOUND", err.to_string()),
            ScheduleError::InvalidCronExpression { expression, .. } => {
                let details = serde_json::json!({ "expression": expression });
                ApiError::new("SCHEDULE_ERROR", err.to_string()).with_details(details)
            }
            _ => ApiError::new("SCHEDULE_ERROR", err.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let code = if err.is_configuration() {
            "CONFIGURATION_ERROR"
        } else {
            "DISPATCH_ERROR"
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let code = match err {
            HubError::ConnectionNotFound(_) => "NOT_FOUND",
            _ => "HUB_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::new("STORE_ERROR", err.to_string())
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        ApiError::new("CATALOG_ERROR", err.to_string())
    }
}
