use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::store::StoreError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "message": "Insufficient stock for SKU-1: requested 6, available 5",
    "code": "insufficient_stock",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error code
    pub code: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: &str, message: String) -> Self {
        Self {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message,
            code: code.to_string(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Failure kinds of a stock operation. Every variant is fatal for the whole
/// batch it occurred in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StockError {
    #[error("Product {0} does not exist")]
    NotFound(String),

    #[error("Invalid quantity {quantity} for {product_code}")]
    InvalidQuantity { product_code: String, quantity: i32 },

    #[error("Insufficient stock for {product_code}: requested {requested}, available {available}")]
    InsufficientStock {
        product_code: String,
        requested: i32,
        available: i32,
    },

    #[error("Product {0} already exists")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stock is locked by a concurrent operation, try again")]
    Busy,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Alias used by the decrement path, whose contract names its error type.
pub type DecrementError = StockError;

impl StockError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidQuantity { .. } | Self::InsufficientStock { .. } | Self::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
            Self::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidQuantity { .. } => "invalid_quantity",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::AlreadyExists(_) => "already_exists",
            Self::Validation(_) => "validation_error",
            Self::Busy => "busy",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Message suitable for HTTP responses. Infrastructure details stay in the logs.
    pub fn response_message(&self) -> String {
        match self {
            Self::StoreUnavailable(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<StoreError> for StockError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy => StockError::Busy,
            StoreError::Conflict(code) => StockError::AlreadyExists(code),
            other => StockError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Error returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Stock(#[from] StockError),

    /// Body could not be parsed as the expected JSON
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::BadRequest(rejection.body_text())
    }
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Stock(err) => err.status_code(),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Stock(err) => err.code(),
            Self::BadRequest(_) => "bad_request",
        }
    }

    pub fn response_message(&self) -> String {
        match self {
            Self::Stock(err) => err.response_message(),
            Self::BadRequest(_) => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse::new(status, self.code(), self.response_message());
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for StockError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}
