//! HTTP API request/response types.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HealthStatus {
    pub status: String,
    /// Name of the document store backend.
    pub backend: String,
    pub durable: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

/// Free-form JSON object passed to and returned from an action.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
#[serde(transparent)]
pub struct ActionPayload(#[schema(value_type = Object)] pub Value);
