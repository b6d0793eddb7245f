//! Notification actions: a user reads their own notifications and flips `unread`.
use super::{Action, ActionOutput, ResourceKind};
use crate::error::{ActionError, ActionResult};
use crate::model::{CREATION_TIMESTAMP_PATH, ID_FIELD, Operation, User, collections};
use crate::store::DocumentStore;
use crate::store::filter::{Filter, SortKey};
use crate::store::query::Query;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 10;

pub struct NotificationActions {
    notifications: Query,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest {
    /// Include notifications already read.
    #[serde(default)]
    all: bool,
    /// Only notifications created strictly before this timestamp.
    #[serde(default)]
    before: Option<f64>,
    #[serde(default)]
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    id: String,
    unread: bool,
}

impl NotificationActions {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            notifications: Query::new(store, collections::NOTIFICATIONS),
        }
    }
}

#[async_trait]
impl Action for NotificationActions {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Notifications
    }

    fn check_permissions(&self, _caller: &User, _operation: Operation, _body: &Value) -> bool {
        true
    }

    async fn update(&self, caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: UpdateRequest = serde_json::from_value(body)?;
        let mut document = self
            .notifications
            .find_one(
                Filter::eq(ID_FIELD, request.id.as_str())
                    .and(Filter::eq("user", caller.username.as_str())),
            )
            .await?
            .ok_or_else(|| ActionError::ObjectNotFound(format!("notification {}", request.id)))?;
        document.set_path("unread", Value::Bool(request.unread));
        let stored = self.notifications.update(document).await?;
        Ok(ActionOutput::body(stored.into_value()))
    }

    async fn retrieve(&self, caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: RetrieveRequest = if body.is_null() {
            RetrieveRequest::default()
        } else {
            serde_json::from_value(body)?
        };
        let mut criteria = Filter::eq("user", caller.username.as_str());
        if !request.all {
            criteria = criteria.and(Filter::eq("unread", true));
        }
        if let Some(before) = request.before {
            criteria = criteria.and(Filter::lt(CREATION_TIMESTAMP_PATH, before));
        }
        let page_size = request.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let documents = self
            .notifications
            .find(
                criteria,
                &[SortKey::descending(CREATION_TIMESTAMP_PATH)],
                page_size,
            )
            .await?;
        let items: Vec<Value> = documents.into_iter().map(|doc| doc.into_value()).collect();
        Ok(ActionOutput::body(json!({ "items": items })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Document, Role};
    use crate::store::StoreConfig;
    use crate::store::memory::InMemoryStore;

    fn user(username: &str) -> User {
        User {
            id: None,
            username: username.to_string(),
            role: Role::User,
            firstname: String::new(),
            lastname: String::new(),
            notifications: Default::default(),
            metadata: Default::default(),
        }
    }

    async fn seeded() -> (NotificationActions, Query) {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new(StoreConfig::default()));
        let query = Query::new(store.clone(), collections::NOTIFICATIONS);
        for (subject, target, unread) in [
            ("first", "u1", true),
            ("second", "u1", false),
            ("third", "u1", true),
            ("other", "u2", true),
        ] {
            query
                .insert(
                    Document::try_from(json!({
                        "subject": subject,
                        "user": target,
                        "unread": unread,
                    }))
                    .expect("object"),
                )
                .await
                .expect("insert");
        }
        (NotificationActions::new(store), query)
    }

    fn subjects(output: &ActionOutput) -> Vec<String> {
        output.body["items"]
            .as_array()
            .expect("items")
            .iter()
            .map(|item| item["subject"].as_str().expect("subject").to_string())
            .collect()
    }

    #[tokio::test]
    async fn retrieve_returns_own_unread_newest_first() {
        let (actions, _) = seeded().await;
        let output = actions.retrieve(&user("u1"), Value::Null).await.expect("retrieve");
        assert_eq!(subjects(&output), vec!["third", "first"]);

        let output = actions
            .retrieve(&user("u1"), json!({"all": true, "pageSize": 2}))
            .await
            .expect("retrieve");
        assert_eq!(subjects(&output), vec!["third", "second"]);
    }

    #[tokio::test]
    async fn retrieve_pages_with_before() {
        let (actions, query) = seeded().await;
        let third = query
            .find_one(Filter::eq("subject", "third"))
            .await
            .expect("find")
            .expect("third");
        let before = third.creation_timestamp().expect("timestamp");
        let output = actions
            .retrieve(&user("u1"), json!({"all": true, "before": before}))
            .await
            .expect("retrieve");
        assert_eq!(subjects(&output), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn update_flips_unread_for_owner_only() {
        let (actions, query) = seeded().await;
        let first = query
            .find_one(Filter::eq("subject", "first"))
            .await
            .expect("find")
            .expect("first");
        let id = first.id().expect("id").to_string();

        let err = actions
            .update(&user("u2"), json!({"id": id, "unread": false}))
            .await
            .expect_err("not owner");
        assert!(matches!(err, ActionError::ObjectNotFound(_)));

        let output = actions
            .update(&user("u1"), json!({"id": id, "unread": false}))
            .await
            .expect("update");
        assert_eq!(output.body["unread"], json!(false));
        assert!(output.event.is_none());
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let (actions, _) = seeded().await;
        let err = actions
            .update(&user("u1"), json!({"unread": false}))
            .await
            .expect_err("missing id");
        assert!(matches!(err, ActionError::Validation(_)));
        let err = actions
            .create(&user("u1"), Value::Null)
            .await
            .expect_err("unsupported");
        assert!(matches!(err, ActionError::UnsupportedOperation { .. }));
    }
}
