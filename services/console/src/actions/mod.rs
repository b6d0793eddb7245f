//! Resource actions and the dispatcher that routes to them.
//!
//! # Purpose
//! Every resource kind implements [`Action`]: a permission check, any subset of
//! `create`/`update`/`delete`/`retrieve`, and the operations whose success triggers notification
//! fan-out. [`ActionDispatcher`] maps a [`ResourceKind`] to its implementation statically.
//!
//! # Notes
//! Fan-out runs detached after the mutation succeeds; its outcome never changes the response.
use crate::coordinator::NamespaceCoordinator;
use crate::error::{ActionError, ActionResult};
use crate::fanout::{FanoutEvent, NotificationFanout};
use crate::model::{Operation, User, collections};
use crate::orchestration::OrchestrationApi;
use crate::store::DocumentStore;
use crate::store::filter::Filter;
use crate::store::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

pub mod logs;
pub mod namespaces;
pub mod notifications;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Namespaces,
    Notifications,
    Logs,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespaces => "namespaces",
            ResourceKind::Notifications => "notifications",
            ResourceKind::Logs => "logs",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ActionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "namespaces" => Ok(ResourceKind::Namespaces),
            "notifications" => Ok(ResourceKind::Notifications),
            "logs" => Ok(ResourceKind::Logs),
            other => Err(ActionError::ObjectNotFound(format!("resource kind {other}"))),
        }
    }
}

/// Result of an action: the response body and, for mutations, the event to fan out.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub body: Value,
    pub event: Option<FanoutEvent>,
}

impl ActionOutput {
    pub fn body(body: Value) -> Self {
        Self { body, event: None }
    }

    pub fn with_event(mut self, event: FanoutEvent) -> Self {
        self.event = Some(event);
        self
    }
}

fn unsupported(kind: ResourceKind, operation: Operation) -> ActionError {
    ActionError::UnsupportedOperation {
        resource: kind.as_str(),
        operation: operation.as_str(),
    }
}

#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn check_permissions(&self, caller: &User, operation: Operation, body: &Value) -> bool;

    async fn create(&self, _caller: &User, _body: Value) -> ActionResult<ActionOutput> {
        Err(unsupported(self.kind(), Operation::Create))
    }

    async fn update(&self, _caller: &User, _body: Value) -> ActionResult<ActionOutput> {
        Err(unsupported(self.kind(), Operation::Update))
    }

    async fn delete(&self, _caller: &User, _body: Value) -> ActionResult<ActionOutput> {
        Err(unsupported(self.kind(), Operation::Delete))
    }

    async fn retrieve(&self, _caller: &User, _body: Value) -> ActionResult<ActionOutput> {
        Err(unsupported(self.kind(), Operation::Retrieve))
    }

    /// Operations whose successful result is fanned out as notifications.
    fn notification_hooks(&self) -> &'static [Operation] {
        &[]
    }
}

/// Response of a dispatched action.
pub struct Dispatched {
    pub body: Value,
    /// Detached fan-out started for this action, if any.
    pub fanout: Option<JoinHandle<()>>,
}

pub struct ActionDispatcher {
    namespaces: namespaces::NamespaceActions,
    notifications: notifications::NotificationActions,
    logs: logs::LogActions,
    fanout: NotificationFanout,
    users: Query,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        orchestrator: Arc<dyn OrchestrationApi>,
        coordinator: Arc<NamespaceCoordinator>,
    ) -> Self {
        Self {
            namespaces: namespaces::NamespaceActions::new(store.clone(), coordinator),
            notifications: notifications::NotificationActions::new(store.clone()),
            logs: logs::LogActions::new(orchestrator),
            fanout: NotificationFanout::new(store.clone()),
            users: Query::new(store, collections::USERS),
        }
    }

    pub fn action(&self, kind: ResourceKind) -> &dyn Action {
        match kind {
            ResourceKind::Namespaces => &self.namespaces,
            ResourceKind::Notifications => &self.notifications,
            ResourceKind::Logs => &self.logs,
        }
    }

    /// Look up a live user by username.
    pub async fn caller(&self, username: &str) -> ActionResult<Option<User>> {
        let Some(document) = self.users.find_one(Filter::eq("username", username)).await? else {
            return Ok(None);
        };
        Ok(Some(
            document
                .into_model()
                .map_err(crate::store::StoreError::from)?,
        ))
    }

    pub async fn dispatch(
        &self,
        caller: &User,
        kind: ResourceKind,
        operation: Operation,
        body: Value,
    ) -> ActionResult<Dispatched> {
        let action = self.action(kind);
        if !action.check_permissions(caller, operation, &body) {
            tracing::info!(user = %caller.username, %kind, %operation, "action denied");
            return Err(ActionError::Forbidden(format!(
                "{} may not {operation} {kind}",
                caller.username
            )));
        }
        let output = match operation {
            Operation::Create => action.create(caller, body).await?,
            Operation::Update => action.update(caller, body).await?,
            Operation::Delete => action.delete(caller, body).await?,
            Operation::Retrieve => action.retrieve(caller, body).await?,
        };
        let fanout = match output.event {
            Some(event) if action.notification_hooks().contains(&operation) => {
                Some(self.fanout.spawn(event))
            }
            _ => None,
        };
        tracing::debug!(user = %caller.username, %kind, %operation, "action completed");
        Ok(Dispatched {
            body: output.body,
            fanout,
        })
    }
}
