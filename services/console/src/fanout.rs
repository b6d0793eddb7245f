//! Notification fan-out.
//!
//! # Purpose
//! Turns one triggering event into one unread notification document per target user:
//! - namespace-scoped events target that namespace's current members;
//! - everything else targets every administrator.
//!
//! # Failure model
//! Fan-out never decides the outcome of the mutation that triggered it. [`NotificationFanout::spawn`]
//! runs detached; failures are logged and counted, not returned to the caller.
use crate::model::{
    Document, Notification, Operation, ResourceRef, Role, collections,
};
use crate::store::filter::Filter;
use crate::store::query::Query;
use crate::store::{DocumentStore, StoreResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A user-relevant state change.
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutEvent {
    /// Username of the caller that caused the change.
    pub trigger: String,
    pub operation: Operation,
    pub kind: String,
    pub name: String,
    pub subject: String,
    /// Target the namespace's members instead of the administrators.
    pub namespace: Option<String>,
}

#[derive(Clone)]
pub struct NotificationFanout {
    notifications: Query,
    namespaces: Query,
    users: Query,
}

/// Usernames of every live administrator.
pub async fn administrator_usernames(users: &Query) -> StoreResult<Vec<String>> {
    let admins = users
        .find(Filter::eq("role", Role::Administrator.as_str()), &[], 0)
        .await?;
    Ok(admins
        .iter()
        .filter_map(|user| user.get("username").and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect())
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            notifications: Query::new(store.clone(), collections::NOTIFICATIONS),
            namespaces: Query::new(store.clone(), collections::NAMESPACES),
            users: Query::new(store, collections::USERS),
        }
    }

    async fn targets(&self, namespace: Option<&str>) -> StoreResult<BTreeSet<String>> {
        let Some(namespace) = namespace else {
            return Ok(administrator_usernames(&self.users)
                .await?
                .into_iter()
                .collect());
        };
        let Some(document) = self.namespaces.find_one(Filter::eq("name", namespace)).await? else {
            tracing::warn!(namespace, "fan-out target namespace not found");
            return Ok(BTreeSet::new());
        };
        Ok(document
            .get("members")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|member| member.as_str())
            .map(str::to_string)
            .collect())
    }

    /// Insert one notification per target; returns how many were written.
    ///
    /// An empty subject is a no-op.
    pub async fn fanout(&self, event: FanoutEvent) -> StoreResult<usize> {
        if event.subject.is_empty() {
            tracing::debug!(kind = %event.kind, name = %event.name, "empty subject, nothing to notify");
            return Ok(0);
        }
        let targets = self.targets(event.namespace.as_deref()).await?;
        let documents = targets
            .into_iter()
            .map(|user| {
                Document::from_model(&Notification {
                    id: None,
                    trigger: event.trigger.clone(),
                    operation: event.operation,
                    resource: ResourceRef {
                        kind: event.kind.clone(),
                        name: event.name.clone(),
                        namespace: event.namespace.clone(),
                    },
                    subject: event.subject.clone(),
                    unread: true,
                    user,
                    metadata: Default::default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let inserted = self.notifications.insert_many(documents).await?.len();
        metrics::counter!("console_notifications_total").increment(inserted as u64);
        tracing::debug!(
            kind = %event.kind,
            name = %event.name,
            operation = %event.operation,
            targets = inserted,
            "notifications fanned out"
        );
        Ok(inserted)
    }

    /// Run [`NotificationFanout::fanout`] detached from the caller.
    pub fn spawn(&self, event: FanoutEvent) -> JoinHandle<()> {
        let fanout = self.clone();
        tokio::spawn(async move {
            let kind = event.kind.clone();
            let name = event.name.clone();
            if let Err(err) = fanout.fanout(event).await {
                metrics::counter!("console_fanout_failures_total").increment(1);
                tracing::error!(error = %err, %kind, %name, "notification fan-out failed");
            }
        })
    }
}

/// Subject for a newly created resource.
pub fn created_subject(kind: &str, name: &str) -> String {
    format!("created {kind} {name}")
}

/// Human sentence describing a membership change, or empty when nothing changed.
pub fn membership_diff_subject(namespace: &str, previous: &[String], requested: &[String]) -> String {
    let previous: BTreeSet<&str> = previous.iter().map(String::as_str).collect();
    let requested: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    let added: Vec<&str> = requested.difference(&previous).copied().collect();
    let removed: Vec<&str> = previous.difference(&requested).copied().collect();
    match (added.is_empty(), removed.is_empty()) {
        (true, true) => String::new(),
        (false, true) => format!("added {} to namespace {namespace}", added.join(", ")),
        (true, false) => format!("removed {} from namespace {namespace}", removed.join(", ")),
        (false, false) => format!(
            "added {} and removed {} from namespace {namespace}",
            added.join(", "),
            removed.join(", ")
        ),
    }
}
