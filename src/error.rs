//! HTTP error taxonomy. Every variant renders as a JSON body with at least
//! an `error` field; server-side variants are logged when rendered.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// a required field was absent; carries the payload as received
    #[error("{message}")]
    MissingFields { message: &'static str, received: Value },

    /// a field was present but could not be coerced to its type
    #[error("invalid value for field '{field}'")]
    InvalidField { field: &'static str, received: Value },

    /// the store rejected a read or write
    #[error("{message}: {details}")]
    StorageFailure { message: &'static str, details: String },

    /// anything else: unreadable or malformed body, panics, failed tasks
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn storage(message: &'static str, err: anyhow::Error) -> Self {
        ApiError::StorageFailure { message, details: format!("{:#}", err) }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFields { .. } | ApiError::InvalidField { .. } => StatusCode::BAD_REQUEST,
            ApiError::StorageFailure { .. } | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            ApiError::MissingFields { message, received } => json!({
                "error": message,
                "received": received,
            }),
            ApiError::InvalidField { field, received } => json!({
                "error": self.to_string(),
                "field": field,
                "received": received,
            }),
            ApiError::StorageFailure { message, details } => json!({
                "error": message,
                "details": details,
            }),
            ApiError::Internal(details) => json!({
                "error": "internal server error",
                "details": details,
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
