use super::Metadata;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Administrator,
    #[default]
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::User => "user",
        }
    }
}

/// Per-user digest preferences.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    /// Opt-in for the daily namespace digest.
    #[serde(default)]
    pub namespace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub metadata: Metadata,
}

impl User {
    pub fn is_administrator(&self) -> bool {
        self.role == Role::Administrator
    }
}
