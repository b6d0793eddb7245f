//! API error types and helpers.
//!
//! # Purpose and responsibility
//! Centralizes HTTP error response construction so every endpoint returns the
//! same `{code, message, request_id}` body.
//!
//! # Key invariants and assumptions
//! - Each [`ActionError`] kind maps to exactly one status code and `code`.
//! - Internal and store errors log details server-side and return a generic message.
use crate::api::types::ErrorResponse;
use crate::error::ActionError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Structured API error returned by handlers.
///
/// # Example
/// ```rust
/// use axum::http::StatusCode;
/// use console::api::error::ApiError;
/// use console::error::ActionError;
///
/// let err = ApiError::from(ActionError::Forbidden("nope".to_string()));
/// assert_eq!(err.status, StatusCode::FORBIDDEN);
/// assert_eq!(err.body.code, "forbidden");
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
                request_id: None,
            },
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.body.request_id = request_id;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Build a 401 Unauthorized error.
pub fn api_unauthorized(message: &str) -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

/// Build a 400 Bad Request validation error.
pub fn api_validation_error(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "validation_error", message)
}

/// Build a 500 Internal Server Error with a generic message.
pub fn api_internal_message(message: &str) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        match &err {
            ActionError::Validation(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
            }
            ActionError::Forbidden(_) => {
                ApiError::new(StatusCode::FORBIDDEN, "forbidden", err.to_string())
            }
            ActionError::ObjectNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
            ActionError::Conflict(_) => {
                ApiError::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            ActionError::UnsupportedOperation { .. } => ApiError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "unsupported_operation",
                err.to_string(),
            ),
            ActionError::ExternalApi(source) => {
                tracing::warn!(error = %source, "orchestration api call failed");
                ApiError::new(StatusCode::BAD_GATEWAY, "external_api", err.to_string())
            }
            ActionError::ConvergenceTimeout(_) => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "convergence_timeout",
                err.to_string(),
            ),
            ActionError::ChangeLogTruncated { .. }
            | ActionError::Store(_)
            | ActionError::Internal(_) => {
                tracing::error!(error = ?err, "console action failed");
                api_internal_message("internal error")
            }
        }
    }
}
