#![allow(dead_code)]

use async_trait::async_trait;
use console::app::AppState;
use console::model::{Document, collections};
use console::orchestration::{
    ExternalNamespace, OrchestrationApi, OrchestrationError, PodLogRequest,
};
use console::store::memory::InMemoryStore;
use console::store::query::Query;
use console::store::{DocumentStore, StoreConfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

/// Orchestration API double that records calls and, like the mirror loop,
/// makes created namespaces appear in the document store.
pub struct FakeOrchestrator {
    namespaces: Query,
    /// Skip the local mirror insert, so convergence never happens.
    pub silent: bool,
    pub mirror_delay: Duration,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub logs: Mutex<Vec<PodLogRequest>>,
}

impl FakeOrchestrator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            namespaces: Query::new(store, collections::NAMESPACES),
            silent: false,
            mirror_delay: Duration::ZERO,
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().expect("lock").clone()
    }
}

#[async_trait]
impl OrchestrationApi for FakeOrchestrator {
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), OrchestrationError> {
        self.created.lock().expect("lock").push(name.to_string());
        if self.silent {
            return Ok(());
        }
        let namespaces = self.namespaces.clone();
        let document = Document::try_from(json!({
            "name": name,
            "members": [],
            "metadata": {"labels": labels},
        }))
        .expect("object");
        let delay = self.mirror_delay;
        // The mirror lands after the API call returns, as it would in a cluster.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            namespaces.insert(document).await.expect("mirror insert");
        });
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestrationError> {
        self.deleted.lock().expect("lock").push(name.to_string());
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<ExternalNamespace>, OrchestrationError> {
        Ok(self
            .created()
            .into_iter()
            .map(|name| ExternalNamespace {
                name,
                labels: BTreeMap::new(),
            })
            .collect())
    }

    async fn pod_log(&self, request: &PodLogRequest) -> Result<String, OrchestrationError> {
        self.logs.lock().expect("lock").push(request.clone());
        Ok(format!("log of {}/{}\n", request.namespace, request.pod))
    }
}

pub struct Harness {
    pub store: Arc<dyn DocumentStore>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub state: AppState,
}

/// Memory-backed state with users `admin1` (administrator), `u1` and `u2`.
pub async fn harness_with(
    configure: impl FnOnce(&mut FakeOrchestrator),
    convergence_timeout: Duration,
) -> Harness {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new(StoreConfig::default()));
    let users = Query::new(store.clone(), collections::USERS);
    for (username, role) in [("admin1", "administrator"), ("u1", "user"), ("u2", "user")] {
        users
            .insert(
                Document::try_from(json!({
                    "username": username,
                    "role": role,
                    "notifications": {"namespace": true},
                }))
                .expect("object"),
            )
            .await
            .expect("seed user");
    }
    let mut orchestrator = FakeOrchestrator::new(store.clone());
    configure(&mut orchestrator);
    let orchestrator = Arc::new(orchestrator);
    let state = AppState::new(store.clone(), orchestrator.clone(), convergence_timeout);
    Harness {
        store,
        orchestrator,
        state,
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}, Duration::from_secs(2)).await
}
