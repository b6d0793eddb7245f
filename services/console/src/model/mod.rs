//! Console data model.
//!
//! # Purpose
//! Re-exports the generic resource document, the typed views over it
//! (namespaces, notifications, users), and the change-log payloads read by
//! watchers.
mod change;
mod document;
mod namespace;
mod notification;
mod operation;
mod user;

pub use change::{ChangeEntry, ChangeFilter, ChangeOp, LogPosition};
pub use document::{
    CREATION_TIMESTAMP_PATH, DELETION_TIMESTAMP_PATH, Document, ID_FIELD, Metadata,
    RESOURCE_VERSION_PATH,
};
pub use namespace::{
    NamespaceCreateRequest, NamespaceDeleteRequest, NamespaceRecord, NamespaceRequestMetadata,
    NamespaceUpdateRequest,
};
pub use notification::{Notification, ResourceRef};
pub use operation::Operation;
pub use user::{NotificationSettings, Role, User};

/// Collection names shared by every backend.
pub mod collections {
    pub const NAMESPACES: &str = "Namespaces";
    pub const NOTIFICATIONS: &str = "Notifications";
    pub const USERS: &str = "Users";
}
