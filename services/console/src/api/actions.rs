//! Action endpoint.
//!
//! # Purpose and responsibility
//! `POST /v1/actions/:resource/:operation` resolves the caller from the
//! `x-console-user` header and hands the JSON body to the
//! [`crate::actions::ActionDispatcher`].
//!
//! # Security considerations
//! - The caller header is trusted as-is; an authenticating proxy is expected in front.
//! - A missing or unknown user is rejected before any action runs.
use crate::actions::ResourceKind;
use crate::api::error::{ApiError, api_unauthorized, api_validation_error};
use crate::api::types::{ActionPayload, ErrorResponse};
use crate::api::{REQUEST_ID_HEADER, USER_HEADER};
use crate::app::AppState;
use crate::error::ActionError;
use crate::model::Operation;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::Value;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(api_validation_error("action body must be a JSON object")),
        Err(err) => Err(api_validation_error(&format!("invalid JSON body: {err}"))),
    }
}

#[utoipa::path(
    post,
    path = "/v1/actions/{resource}/{operation}",
    tag = "actions",
    params(
        ("resource" = ResourceKind, Path, description = "Resource kind"),
        ("operation" = Operation, Path, description = "Operation to run"),
        ("x-console-user" = String, Header, description = "Calling username")
    ),
    request_body = ActionPayload,
    responses(
        (status = 200, description = "Action result", body = ActionPayload),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unknown caller", body = ErrorResponse),
        (status = 403, description = "Permission denied", body = ErrorResponse),
        (status = 404, description = "Object not found", body = ErrorResponse),
        (status = 405, description = "Operation not supported", body = ErrorResponse),
        (status = 409, description = "Conflict", body = ErrorResponse),
        (status = 502, description = "Orchestration API failed", body = ErrorResponse),
        (status = 504, description = "Convergence timed out", body = ErrorResponse)
    )
)]
/// Run one action on behalf of the calling user.
///
/// Notification fan-out triggered by the action runs detached; the response
/// does not wait for it.
pub(crate) async fn run_action(
    State(state): State<AppState>,
    Path((resource, operation)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request_id = header(&headers, REQUEST_ID_HEADER);
    handle(&state, &resource, &operation, &headers, &body)
        .await
        .map(Json)
        .map_err(|err| err.with_request_id(request_id))
}

async fn handle(
    state: &AppState,
    resource: &str,
    operation: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Value, ApiError> {
    let Some(username) = header(headers, USER_HEADER) else {
        return Err(api_unauthorized("missing x-console-user header"));
    };
    let kind: ResourceKind = resource.parse()?;
    let operation: Operation = operation.parse().map_err(|_| ActionError::UnsupportedOperation {
        resource: kind.as_str(),
        operation: "unknown",
    })?;
    let body = parse_body(body)?;
    let Some(caller) = state.dispatcher.caller(&username).await? else {
        tracing::info!(user = %username, "unknown caller");
        return Err(api_unauthorized("unknown user"));
    };
    let dispatched = state
        .dispatcher
        .dispatch(&caller, kind, operation, body)
        .await?;
    Ok(dispatched.body)
}
