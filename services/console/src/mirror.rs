//! Namespace mirror loop.
//!
//! Keeps the `Namespaces` collection in step with the orchestration API: namespaces that exist
//! externally but not locally are inserted (which is what a pending `create` waits to observe),
//! and local namespaces that disappeared externally are soft-deleted.
use crate::model::{Document, collections};
use crate::orchestration::OrchestrationApi;
use crate::store::DocumentStore;
use crate::store::filter::Filter;
use crate::store::query::Query;
use anyhow::Context;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_MIRROR_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub inserted: usize,
    pub deleted: usize,
}

pub struct NamespaceMirror {
    namespaces: Query,
    orchestrator: Arc<dyn OrchestrationApi>,
}

impl NamespaceMirror {
    pub fn new(store: Arc<dyn DocumentStore>, orchestrator: Arc<dyn OrchestrationApi>) -> Self {
        Self {
            namespaces: Query::new(store, collections::NAMESPACES),
            orchestrator,
        }
    }

    pub async fn sync_once(&self) -> anyhow::Result<MirrorReport> {
        let external = self
            .orchestrator
            .list_namespaces()
            .await
            .context("list external namespaces")?;
        let local = self.namespaces.find(Filter::all(), &[], 0).await?;
        let local_names: BTreeSet<&str> = local
            .iter()
            .filter_map(|doc| doc.get("name").and_then(|v| v.as_str()))
            .collect();
        let external_names: BTreeSet<&str> =
            external.iter().map(|ns| ns.name.as_str()).collect();

        let missing = external
            .iter()
            .filter(|ns| !local_names.contains(ns.name.as_str()))
            .map(|ns| {
                Document::try_from(json!({
                    "name": ns.name,
                    "members": [],
                    "metadata": {"labels": ns.labels},
                }))
                .map_err(|value| anyhow::anyhow!("namespace document is not an object: {value}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut report = MirrorReport {
            inserted: self.namespaces.insert_many(missing).await?.len(),
            deleted: 0,
        };

        for document in local.iter().filter(|doc| {
            doc.get("name")
                .and_then(|v| v.as_str())
                .is_some_and(|name| !external_names.contains(name))
        }) {
            self.namespaces.soft_delete(document).await?;
            report.deleted += 1;
        }
        if report != MirrorReport::default() {
            tracing::info!(
                inserted = report.inserted,
                deleted = report.deleted,
                "namespace mirror updated"
            );
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sync_once().await {
                    tracing::warn!(error = %err, "namespace mirror iteration failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{ExternalNamespace, OrchestrationError, PodLogRequest};
    use crate::store::StoreConfig;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Listing(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl OrchestrationApi for Listing {
        async fn create_namespace(
            &self,
            _name: &str,
            _labels: &BTreeMap<String, String>,
        ) -> Result<(), OrchestrationError> {
            Ok(())
        }

        async fn delete_namespace(&self, _name: &str) -> Result<(), OrchestrationError> {
            Ok(())
        }

        async fn list_namespaces(&self) -> Result<Vec<ExternalNamespace>, OrchestrationError> {
            Ok(self
                .0
                .lock()
                .expect("lock")
                .iter()
                .map(|name| ExternalNamespace {
                    name: name.to_string(),
                    labels: BTreeMap::from([("source".to_string(), "cluster".to_string())]),
                })
                .collect())
        }

        async fn pod_log(&self, _request: &PodLogRequest) -> Result<String, OrchestrationError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn inserts_missing_and_soft_deletes_vanished() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new(StoreConfig::default()));
        let listing = Arc::new(Listing(Mutex::new(vec!["default", "team-a"])));
        let mirror = NamespaceMirror::new(store.clone(), listing.clone());
        let namespaces = Query::new(store, collections::NAMESPACES);

        let report = mirror.sync_once().await.expect("sync");
        assert_eq!(report, MirrorReport { inserted: 2, deleted: 0 });
        let team_a = namespaces
            .find_one(Filter::eq("name", "team-a"))
            .await
            .expect("find")
            .expect("team-a");
        assert_eq!(team_a.get_path("metadata.labels.source"), Some(&json!("cluster")));

        assert_eq!(mirror.sync_once().await.expect("sync"), MirrorReport::default());

        listing.0.lock().expect("lock").retain(|name| *name != "team-a");
        let report = mirror.sync_once().await.expect("sync");
        assert_eq!(report, MirrorReport { inserted: 0, deleted: 1 });
        assert!(namespaces.find_one(Filter::eq("name", "team-a")).await.expect("find").is_none());
        assert_eq!(
            namespaces
                .find_including_deleted(Filter::eq("name", "team-a"), &[], 0)
                .await
                .expect("find")
                .len(),
            1
        );
    }
}
