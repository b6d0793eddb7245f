//! Namespace actions: administrators manage namespaces through the coordinator; everyone may
//! list the namespaces they belong to.
use super::{Action, ActionOutput, ResourceKind};
use crate::coordinator::NamespaceCoordinator;
use crate::error::ActionResult;
use crate::fanout::{FanoutEvent, created_subject, membership_diff_subject};
use crate::model::{
    NamespaceCreateRequest, NamespaceDeleteRequest, NamespaceUpdateRequest, Operation, User,
    collections,
};
use crate::store::DocumentStore;
use crate::store::filter::{Filter, SortKey};
use crate::store::query::Query;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

const KIND: &str = "Namespace";

pub struct NamespaceActions {
    namespaces: Query,
    coordinator: Arc<NamespaceCoordinator>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrieveRequest {
    #[serde(default)]
    name: Option<String>,
}

impl NamespaceActions {
    pub fn new(store: Arc<dyn DocumentStore>, coordinator: Arc<NamespaceCoordinator>) -> Self {
        Self {
            namespaces: Query::new(store, collections::NAMESPACES),
            coordinator,
        }
    }
}

#[async_trait]
impl Action for NamespaceActions {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Namespaces
    }

    fn check_permissions(&self, caller: &User, operation: Operation, _body: &Value) -> bool {
        // Listing is filtered by membership instead.
        operation == Operation::Retrieve || caller.is_administrator()
    }

    async fn create(&self, caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: NamespaceCreateRequest = serde_json::from_value(body)?;
        let created = self.coordinator.create(request).await?;
        let event = FanoutEvent {
            trigger: caller.username.clone(),
            operation: Operation::Create,
            kind: KIND.to_string(),
            name: created.name.clone(),
            subject: created_subject(KIND, &created.name),
            namespace: None,
        };
        Ok(ActionOutput::body(serde_json::to_value(&created)?).with_event(event))
    }

    async fn update(&self, caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: NamespaceUpdateRequest = serde_json::from_value(body)?;
        let (before, after) = self.coordinator.update(request).await?;
        let event = FanoutEvent {
            trigger: caller.username.clone(),
            operation: Operation::Update,
            kind: KIND.to_string(),
            name: after.name.clone(),
            subject: membership_diff_subject(&after.name, &before.members, &after.members),
            namespace: Some(after.name.clone()),
        };
        Ok(ActionOutput::body(serde_json::to_value(&after)?).with_event(event))
    }

    async fn delete(&self, _caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: NamespaceDeleteRequest = serde_json::from_value(body)?;
        self.coordinator.delete(request.clone()).await?;
        Ok(ActionOutput::body(json!({"name": request.name, "deleted": true})))
    }

    async fn retrieve(&self, caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: RetrieveRequest = if body.is_null() {
            RetrieveRequest::default()
        } else {
            serde_json::from_value(body)?
        };
        let mut criteria = Filter::all();
        if let Some(name) = request.name {
            criteria = criteria.and(Filter::eq("name", name));
        }
        if !caller.is_administrator() {
            criteria = criteria.and(Filter::eq("members", caller.username.as_str()));
        }
        let documents = self
            .namespaces
            .find(criteria, &[SortKey::ascending("name")], 0)
            .await?;
        let items: Vec<Value> = documents.into_iter().map(|doc| doc.into_value()).collect();
        Ok(ActionOutput::body(json!({ "items": items })))
    }

    fn notification_hooks(&self) -> &'static [Operation] {
        &[Operation::Create, Operation::Update]
    }
}
