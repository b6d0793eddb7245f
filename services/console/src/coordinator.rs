//! Namespace coordinator.
//!
//! # Purpose
//! A namespace lives in two independently writable systems: the orchestration API and the
//! `Namespaces` collection. `create` is complete only once both agree: the external API has
//! acknowledged the namespace *and* its mirrored document has been observed on the store's
//! change log.
//!
//! # Ordering
//! The change-log head is captured before any write. Watching from that position guarantees the
//! mirrored insert cannot land before the watcher starts, however fast the external system is.
//!
//! # Concurrency
//! The external write and the change-log wait run as two spawned tasks joined with fail-fast AND
//! semantics, bounded by `convergence_timeout`. Both tasks are aborted once the join resolves.
//! No rollback of the external write is attempted on failure.
//!
//! Creates of the same name are serialized per process: a second `create` for a name whose
//! create is still in flight fails with `Conflict` instead of reaching the orchestration API.
use crate::error::{ActionError, ActionResult};
use crate::fanout::administrator_usernames;
use crate::model::{
    ChangeFilter, Document, NamespaceCreateRequest, NamespaceDeleteRequest, NamespaceRecord,
    NamespaceUpdateRequest, collections,
};
use crate::orchestration::{OrchestrationApi, OrchestrationError};
use crate::store::filter::Filter;
use crate::store::query::Query;
use crate::store::{DocumentStore, StoreError};
use crate::watch::ChangeLogWatcher;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_NAME_LEN: usize = 63;

pub struct NamespaceCoordinator {
    store: Arc<dyn DocumentStore>,
    namespaces: Query,
    users: Query,
    orchestrator: Arc<dyn OrchestrationApi>,
    convergence_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Claim on a namespace name for the duration of one `create`; released on drop.
struct InFlight {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl InFlight {
    fn claim(names: &Arc<Mutex<HashSet<String>>>, name: &str) -> Option<Self> {
        let mut claimed = names.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.insert(name.to_string()).then(|| Self {
            names: names.clone(),
            name: name.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut claimed = self
            .names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.remove(&self.name);
    }
}

/// Names must be usable as orchestration namespace names (RFC 1123 labels).
fn validate_name(name: Option<&str>) -> ActionResult<String> {
    let name = name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ActionError::Validation("name is required".into()))?;
    let valid = name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if !valid {
        return Err(ActionError::Validation(format!(
            "invalid namespace name {name:?}: use lowercase letters, digits and '-'"
        )));
    }
    Ok(name.to_string())
}

fn member_set(members: impl IntoIterator<Item = String>) -> Vec<String> {
    members
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn record(document: Document) -> ActionResult<NamespaceRecord> {
    Ok(document.into_model().map_err(StoreError::from)?)
}

async fn joined<T>(handle: &mut JoinHandle<ActionResult<T>>) -> ActionResult<T> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(ActionError::Internal(format!("task failed: {err}"))),
    }
}

impl NamespaceCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        orchestrator: Arc<dyn OrchestrationApi>,
        convergence_timeout: Duration,
    ) -> Self {
        Self {
            namespaces: Query::new(store.clone(), collections::NAMESPACES),
            users: Query::new(store.clone(), collections::USERS),
            store,
            orchestrator,
            convergence_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a namespace externally, wait for its mirror to appear locally, then persist
    /// membership (requested members plus every administrator).
    ///
    /// # Errors
    /// - `Validation` for a missing or malformed name.
    /// - `Conflict` when a live namespace with that name already exists.
    /// - `ExternalApi` when the orchestration API rejects the write.
    /// - `ConvergenceTimeout` when both sides do not complete in time.
    pub async fn create(&self, request: NamespaceCreateRequest) -> ActionResult<NamespaceRecord> {
        let name = validate_name(request.name.as_deref())?;
        let labels = request.labels();
        let Some(_claim) = InFlight::claim(&self.in_flight, &name) else {
            return Err(ActionError::Conflict(format!(
                "namespace {name} is already being created"
            )));
        };

        // Captured before any write; see module docs.
        let from = self.store.change_log_head().await?;
        if self
            .namespaces
            .find_one(Filter::eq("name", name.as_str()))
            .await?
            .is_some()
        {
            return Err(ActionError::Conflict(format!("namespace {name} exists")));
        }

        let started = Instant::now();
        let orchestrator = self.orchestrator.clone();
        let external_name = name.clone();
        let mut external: JoinHandle<ActionResult<()>> = tokio::spawn(async move {
            match orchestrator.create_namespace(&external_name, &labels).await {
                Ok(()) => Ok(()),
                // A retry after a timed-out create lands here; concurrent creates of the same
                // name never do, they are rejected by the in-flight claim.
                Err(OrchestrationError::AlreadyExists { .. }) => {
                    tracing::info!(namespace = %external_name, "external namespace already exists");
                    Ok(())
                }
                Err(err) => Err(ActionError::ExternalApi(err)),
            }
        });

        let mut watcher = ChangeLogWatcher::open(
            self.store.clone(),
            from,
            ChangeFilter::inserts(collections::NAMESPACES),
        );
        let target = name.clone();
        let mut observed: JoinHandle<ActionResult<Document>> = tokio::spawn(async move {
            let entry = watcher
                .wait_for(|entry| {
                    entry.payload.get("name").and_then(Value::as_str) == Some(target.as_str())
                })
                .await?;
            Ok(entry.payload)
        });

        let outcome = tokio::time::timeout(self.convergence_timeout, async {
            tokio::try_join!(joined(&mut external), joined(&mut observed))
        })
        .await;
        external.abort();
        observed.abort();

        let mirrored = match outcome {
            Ok(Ok(((), mirrored))) => mirrored,
            Ok(Err(err)) => {
                tracing::warn!(namespace = %name, error = %err, "namespace create failed");
                return Err(err);
            }
            Err(_) => {
                tracing::warn!(
                    namespace = %name,
                    timeout = ?self.convergence_timeout,
                    "namespace create did not converge"
                );
                return Err(ActionError::ConvergenceTimeout(self.convergence_timeout));
            }
        };
        metrics::histogram!("console_convergence_seconds").record(started.elapsed().as_secs_f64());

        let mut members = request.members;
        members.extend(administrator_usernames(&self.users).await?);
        let members = member_set(members);

        let id = mirrored
            .id()
            .ok_or_else(|| ActionError::Internal("mirrored namespace has no id".into()))?;
        let mut document = self
            .namespaces
            .find_by_id(id)
            .await?
            .ok_or_else(|| ActionError::ObjectNotFound(format!("namespace {name}")))?;
        document.set_path("members", Value::from(members));
        let stored = self.namespaces.update(document).await?;
        tracing::info!(namespace = %name, "namespace created");
        record(stored)
    }

    /// Replace a namespace's members; returns the stored document before and after.
    pub async fn update(
        &self,
        request: NamespaceUpdateRequest,
    ) -> ActionResult<(NamespaceRecord, NamespaceRecord)> {
        let before = self
            .namespaces
            .find_by_id(&request.id)
            .await?
            .ok_or_else(|| ActionError::ObjectNotFound(format!("namespace {}", request.id)))?;
        let mut document = before.clone();
        document.set_path("members", Value::from(member_set(request.members)));
        let after = self.namespaces.update(document).await?;
        Ok((record(before)?, record(after)?))
    }

    /// Delete the namespace from the orchestration API.
    ///
    /// The local document stays; the mirror loop soft-deletes it once the external namespace is gone.
    pub async fn delete(&self, request: NamespaceDeleteRequest) -> ActionResult<()> {
        if request.name.trim().is_empty() {
            return Err(ActionError::Validation("name is required".into()));
        }
        self.orchestrator.delete_namespace(&request.name).await?;
        tracing::info!(namespace = %request.name, "external namespace deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{ExternalNamespace, PodLogRequest};
    use crate::store::StoreConfig;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Orchestrator that optionally mirrors created namespaces into the store.
    #[derive(Default)]
    struct Mirroring {
        namespaces: Option<Query>,
        fail: bool,
        /// Answer this long after the mirror insert landed.
        ack_delay: Duration,
        /// Reject the create after the mirror insert and `ack_delay`.
        fail_after_mirror: bool,
        created: Mutex<Vec<String>>,
        acked_at: Mutex<Option<Instant>>,
    }

    #[async_trait]
    impl OrchestrationApi for Mirroring {
        async fn create_namespace(
            &self,
            name: &str,
            _labels: &BTreeMap<String, String>,
        ) -> Result<(), OrchestrationError> {
            if self.fail {
                return Err(OrchestrationError::Rejected {
                    status: 422,
                    message: "invalid".into(),
                });
            }
            self.created.lock().expect("lock").push(name.to_string());
            if let Some(namespaces) = &self.namespaces {
                namespaces
                    .insert(Document::try_from(json!({"name": name, "members": []})).expect("object"))
                    .await
                    .expect("mirror insert");
            }
            tokio::time::sleep(self.ack_delay).await;
            if self.fail_after_mirror {
                return Err(OrchestrationError::Rejected {
                    status: 500,
                    message: "quota exceeded".into(),
                });
            }
            *self.acked_at.lock().expect("lock") = Some(Instant::now());
            Ok(())
        }

        async fn delete_namespace(&self, _name: &str) -> Result<(), OrchestrationError> {
            Ok(())
        }

        async fn list_namespaces(&self) -> Result<Vec<ExternalNamespace>, OrchestrationError> {
            Ok(Vec::new())
        }

        async fn pod_log(&self, _request: &PodLogRequest) -> Result<String, OrchestrationError> {
            Ok(String::new())
        }
    }

    async fn setup(mirror: bool, fail: bool) -> (NamespaceCoordinator, Arc<Mirroring>, Query) {
        setup_with(|orchestrator| {
            orchestrator.fail = fail;
            if !mirror {
                orchestrator.namespaces = None;
            }
        })
        .await
    }

    async fn setup_with(
        configure: impl FnOnce(&mut Mirroring),
    ) -> (NamespaceCoordinator, Arc<Mirroring>, Query) {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new(StoreConfig::default()));
        let namespaces = Query::new(store.clone(), collections::NAMESPACES);
        Query::new(store.clone(), collections::USERS)
            .insert(
                Document::try_from(json!({"username": "admin1", "role": "administrator"}))
                    .expect("object"),
            )
            .await
            .expect("admin");
        let mut orchestrator = Mirroring {
            namespaces: Some(namespaces.clone()),
            ..Mirroring::default()
        };
        configure(&mut orchestrator);
        let orchestrator = Arc::new(orchestrator);
        let coordinator =
            NamespaceCoordinator::new(store, orchestrator.clone(), Duration::from_millis(300));
        (coordinator, orchestrator, namespaces)
    }

    fn create_request(name: &str, members: &[&str]) -> NamespaceCreateRequest {
        NamespaceCreateRequest {
            name: Some(name.to_string()),
            members: members.iter().map(|m| m.to_string()).collect(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn create_adds_administrators_to_members() {
        let (coordinator, _, _) = setup(true, false).await;
        let created = coordinator
            .create(create_request("team-a", &["u1"]))
            .await
            .expect("create");
        assert_eq!(created.name, "team-a");
        assert_eq!(created.members, vec!["admin1".to_string(), "u1".to_string()]);
    }

    #[tokio::test]
    async fn create_rejects_missing_and_invalid_names() {
        let (coordinator, orchestrator, _) = setup(true, false).await;
        for name in [None, Some(""), Some("Team_A"), Some("-edge")] {
            let err = coordinator
                .create(NamespaceCreateRequest {
                    name: name.map(str::to_string),
                    ..NamespaceCreateRequest::default()
                })
                .await
                .expect_err("invalid");
            assert!(matches!(err, ActionError::Validation(_)));
        }
        assert!(orchestrator.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn existing_live_namespace_conflicts_without_external_call() {
        let (coordinator, orchestrator, _) = setup(true, false).await;
        coordinator
            .create(create_request("team-a", &[]))
            .await
            .expect("create");
        let err = coordinator
            .create(create_request("team-a", &[]))
            .await
            .expect_err("conflict");
        assert!(matches!(err, ActionError::Conflict(_)));
        assert_eq!(orchestrator.created.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn external_failure_surfaces_without_waiting() {
        let (coordinator, _, namespaces) = setup(false, true).await;
        let started = Instant::now();
        let err = coordinator
            .create(create_request("team-a", &[]))
            .await
            .expect_err("external failure");
        assert!(matches!(err, ActionError::ExternalApi(_)));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(namespaces.find(Filter::all(), &[], 0).await.expect("find").is_empty());
    }

    #[tokio::test]
    async fn unobserved_create_times_out() {
        let (coordinator, _, namespaces) = setup(false, false).await;
        let err = coordinator
            .create(create_request("team-a", &["u1"]))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ActionError::ConvergenceTimeout(_)));
        assert!(namespaces.find(Filter::all(), &[], 0).await.expect("find").is_empty());
    }

    #[tokio::test]
    async fn update_replaces_members_and_returns_both_versions() {
        let (coordinator, _, _) = setup(true, false).await;
        let created = coordinator
            .create(create_request("team-a", &["u1", "u2"]))
            .await
            .expect("create");
        let (before, after) = coordinator
            .update(NamespaceUpdateRequest {
                id: created.id.clone().expect("id"),
                members: vec!["u3".into(), "u2".into()],
            })
            .await
            .expect("update");
        assert_eq!(before.members, created.members);
        assert_eq!(after.members, vec!["u2".to_string(), "u3".to_string()]);
        assert!(after.metadata.resource_version > before.metadata.resource_version);

        let err = coordinator
            .update(NamespaceUpdateRequest {
                id: "missing".into(),
                members: Vec::new(),
            })
            .await
            .expect_err("missing");
        assert!(matches!(err, ActionError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn late_external_rejection_fails_after_observation() {
        let (coordinator, _, namespaces) = setup_with(|orchestrator| {
            orchestrator.ack_delay = Duration::from_millis(150);
            orchestrator.fail_after_mirror = true;
        })
        .await;
        let started = Instant::now();
        let err = coordinator
            .create(create_request("team-a", &["u1"]))
            .await
            .expect_err("external rejection");
        assert!(matches!(err, ActionError::ExternalApi(_)));
        assert!(started.elapsed() >= Duration::from_millis(150));

        // The mirror landed, but membership was never persisted onto it.
        let mirrored = namespaces
            .find_one(Filter::eq("name", "team-a"))
            .await
            .expect("find")
            .expect("mirrored");
        assert_eq!(mirrored.get("members"), Some(&json!([])));
    }

    #[tokio::test]
    async fn observed_create_still_waits_for_external_ack() {
        let (coordinator, orchestrator, _) = setup_with(|orchestrator| {
            orchestrator.ack_delay = Duration::from_millis(150);
        })
        .await;
        let created = coordinator
            .create(create_request("team-a", &["u1"]))
            .await
            .expect("create");
        let returned_at = Instant::now();
        let acked_at = *orchestrator.acked_at.lock().expect("lock");
        let acked_at = acked_at.expect("external call finished");
        assert!(acked_at <= returned_at);
        assert_eq!(created.members, vec!["admin1".to_string(), "u1".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_creates_of_one_name_reach_the_api_once() {
        let (coordinator, orchestrator, _) = setup_with(|orchestrator| {
            orchestrator.ack_delay = Duration::from_millis(100);
        })
        .await;
        let (first, second) = tokio::join!(
            coordinator.create(create_request("team-a", &["u1"])),
            coordinator.create(create_request("team-a", &["u2"])),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .any(|outcome| matches!(outcome, Err(ActionError::Conflict(_))))
        );
        assert_eq!(*orchestrator.created.lock().expect("lock"), vec!["team-a".to_string()]);

        // The claim is released once the first create finishes.
        let err = coordinator
            .create(create_request("team-a", &[]))
            .await
            .expect_err("exists");
        assert!(matches!(err, ActionError::Conflict(_)));
    }
}
