//! Daily notification digest.
//!
//! # Purpose
//! Users who opted into namespace notifications get one digest per UTC day summarizing the unread
//! notifications created during the previous day. Delivery is behind [`DigestSink`]; the default
//! sink only logs.
//!
//! # Failure model
//! The loop never exits on a failed iteration: errors are logged, counted, and the next tick
//! retries. A user whose delivery fails is not stamped, so the next iteration picks them up again.
use crate::model::{
    CREATION_TIMESTAMP_PATH, ID_FIELD, Notification, User, collections,
};
use crate::store::filter::{Filter, SortKey, Stage};
use crate::store::query::Query;
use crate::store::{DocumentStore, StoreError};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_DIGEST_INTERVAL: Duration = Duration::from_secs(600);

const NOTIFIED_AT_PATH: &str = "notifications.notifiedAt";
const NAMESPACE_PATH: &str = "resource.namespace";

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceActivity {
    pub namespace: String,
    pub updates: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub username: String,
    pub subject: String,
    pub notifications: Vec<Notification>,
    pub namespaces: Vec<NamespaceActivity>,
}

#[async_trait]
pub trait DigestSink: Send + Sync {
    async fn deliver(&self, digest: &Digest) -> anyhow::Result<()>;
}

/// Sink used when no mail transport is configured.
pub struct LoggingSink;

#[async_trait]
impl DigestSink for LoggingSink {
    async fn deliver(&self, digest: &Digest) -> anyhow::Result<()> {
        tracing::info!(
            user = %digest.username,
            subject = %digest.subject,
            namespaces = digest.namespaces.len(),
            "notification digest ready"
        );
        Ok(())
    }
}

/// Start of the UTC day containing `now`, and of the day before it, in epoch seconds.
fn day_window(now: DateTime<Utc>) -> (f64, f64, DateTime<Utc>) {
    let today = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let yesterday = today - ChronoDuration::days(1);
    (
        yesterday.timestamp() as f64,
        today.timestamp() as f64,
        yesterday,
    )
}

pub fn digest_subject(day: DateTime<Utc>, updates: usize, namespaces: usize) -> String {
    format!(
        "Notifications for {} - {updates} updates in {namespaces} namespaces",
        day.format("%b %d, %Y")
    )
}

pub struct DigestLoop {
    users: Query,
    notifications: Query,
    sink: Arc<dyn DigestSink>,
}

impl DigestLoop {
    pub fn new(store: Arc<dyn DocumentStore>, sink: Arc<dyn DigestSink>) -> Self {
        Self {
            users: Query::new(store.clone(), collections::USERS),
            notifications: Query::new(store, collections::NOTIFICATIONS),
            sink,
        }
    }

    /// Opted-in users not notified since before yesterday.
    async fn pending_users(&self, yesterday_start: f64) -> Result<Vec<User>, StoreError> {
        let criteria = Filter::eq("notifications.namespace", true).and(Filter::Or(vec![
            Filter::eq(NOTIFIED_AT_PATH, Value::Null),
            Filter::lt(NOTIFIED_AT_PATH, yesterday_start),
        ]));
        self.users
            .find(criteria, &[], 0)
            .await?
            .into_iter()
            .map(|doc| doc.into_model().map_err(StoreError::from))
            .collect()
    }

    async fn build(&self, user: &User, from: f64, to: f64, day: DateTime<Utc>) -> anyhow::Result<Digest> {
        let criteria = Filter::eq("user", user.username.as_str())
            .and(Filter::eq("unread", true))
            .and(Filter::gte(CREATION_TIMESTAMP_PATH, from))
            .and(Filter::lt(CREATION_TIMESTAMP_PATH, to));
        let notifications: Vec<Notification> = self
            .notifications
            .find(criteria.clone(), &[SortKey::ascending(CREATION_TIMESTAMP_PATH)], 0)
            .await?
            .into_iter()
            .map(|doc| doc.into_model())
            .collect::<Result<_, _>>()
            .context("decode notifications")?;
        // Aggregation does not filter soft-deleted documents on its own.
        let grouped = self
            .notifications
            .aggregate(&[
                Stage::Match(
                    Filter::live()
                        .and(criteria)
                        .and(Filter::exists(NAMESPACE_PATH, true)),
                ),
                Stage::Group {
                    by: NAMESPACE_PATH.to_string(),
                    count_field: "updates".to_string(),
                },
            ])
            .await?;
        let namespaces: Vec<NamespaceActivity> = grouped
            .iter()
            .filter_map(|group| {
                Some(NamespaceActivity {
                    namespace: group.get("key")?.as_str()?.to_string(),
                    updates: group.get("updates")?.as_u64()?,
                })
            })
            .collect();
        Ok(Digest {
            username: user.username.clone(),
            subject: digest_subject(day, notifications.len(), namespaces.len()),
            notifications,
            namespaces,
        })
    }

    async fn mark_notified(&self, user: &User, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(id) = user.id.as_deref() else {
            return Err(StoreError::Malformed(format!("user {} has no id", user.username)));
        };
        let mut fields = Map::new();
        fields.insert(
            NOTIFIED_AT_PATH.to_string(),
            Value::from(now.timestamp_micros() as f64 / 1_000_000.0),
        );
        self.users
            .update_fields(Filter::eq(ID_FIELD, id), fields)
            .await?;
        Ok(())
    }

    /// One pass over pending users; returns how many digests were delivered.
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let (from, to, day) = day_window(now);
        let users = self.pending_users(from).await.context("load pending users")?;
        tracing::debug!(pending = users.len(), "checking pending notification digests");
        let mut delivered = 0;
        for user in users {
            let digest = self.build(&user, from, to, day).await?;
            tracing::info!(
                user = %user.username,
                pending = digest.notifications.len(),
                day = %day.format("%b %d, %Y"),
                "sending notification digest"
            );
            if let Err(err) = self.sink.deliver(&digest).await {
                tracing::warn!(user = %user.username, error = %err, "digest delivery failed");
                continue;
            }
            self.mark_notified(&user, now).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "digest loop started");
            loop {
                match self.run_once(Utc::now()).await {
                    Ok(delivered) => {
                        metrics::counter!("console_digest_runs_total", "outcome" => "ok").increment(1);
                        if delivered > 0 {
                            tracing::info!(delivered, "notification digests delivered");
                        }
                    }
                    Err(err) => {
                        metrics::counter!("console_digest_runs_total", "outcome" => "error")
                            .increment(1);
                        tracing::error!(error = %err, "notification digest iteration failed");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}
