//! Namespace documents and request payloads.
//!
//! # Purpose
//! Typed view over documents in the `Namespaces` collection. The `name` is
//! unique and immutable; `members` is a set of usernames stored sorted.
use super::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct NamespaceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Metadata accepted on namespace creation; only labels are honored.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default)]
pub struct NamespaceRequestMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default)]
pub struct NamespaceCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub metadata: Option<NamespaceRequestMetadata>,
}

impl NamespaceCreateRequest {
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.labels.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct NamespaceUpdateRequest {
    pub id: String,
    pub members: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct NamespaceDeleteRequest {
    pub name: String,
}
