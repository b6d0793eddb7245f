//! Notification documents produced by fan-out.
use super::{Metadata, Operation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One notification per target user per triggering event.
///
/// Only `unread` changes after creation.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub trigger: String,
    pub operation: Operation,
    pub resource: ResourceRef,
    pub subject: String,
    pub unread: bool,
    pub user: String,
    #[serde(default)]
    pub metadata: Metadata,
}
