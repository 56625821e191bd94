//! HTTP response types and utilities
//!
//! Every endpoint answers with an [`ApiResponse`] envelope. Payload fields are
//! flattened next to `success` and `timestamp` so that callers read `taskId`,
//! `status`, etc. at the top level of the body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::errors::{AppError, AppResult};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the operation was successful
    pub success: bool,
    /// Response payload (present on success); must serialize as a map
    #[serde(flatten)]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Helper function to convert AppResult to HTTP response
pub fn handle_result<T>(result: AppResult<T>) -> Response
where
    T: Serialize,
{
    match result {
        Ok(data) => ok(data).into_response(),
        Err(error) => handle_error(error),
    }
}

/// Convert AppError to appropriate HTTP response
pub fn handle_error(error: AppError) -> Response {
    let (status, message) = match &error {
        AppError::Validation { message } => (StatusCode::BAD_REQUEST, message.clone()),
        AppError::NotFound { resource, id } => (
            StatusCode::NOT_FOUND,
            format!("{resource} with id '{id}' not found"),
        ),
        AppError::Store(e) => {
            error!("Store failure while handling request: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Queue store unavailable".to_string(),
            )
        }
        AppError::Serialization(e) => {
            error!("Serialization failure while handling request: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode task".to_string(),
            )
        }
        AppError::Configuration { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Configuration error: {message}"),
        ),
    };

    (status, Json(ApiResponse::<()>::error(message))).into_response()
}

/// Success response helpers
pub fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

/// Error response helpers
pub fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(message.to_string())),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        task_id: String,
    }

    #[test]
    fn test_success_payload_is_flattened() {
        let body = serde_json::to_value(ApiResponse::success(Payload {
            task_id: "t-1".to_string(),
        }))
        .unwrap();

        assert_eq!(body["success"], true);
        assert_eq!(body["taskId"], "t-1");
        assert!(body.get("data").is_none());
        assert!(body.get("error").is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (AppError::validation("URL is required"), StatusCode::BAD_REQUEST),
            (AppError::not_found("trigger", "x"), StatusCode::NOT_FOUND),
            (
                AppError::Store(StoreError::ConnectionFailed {
                    message: "refused".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (AppError::configuration("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(handle_error(error).status(), expected);
        }
    }
}
