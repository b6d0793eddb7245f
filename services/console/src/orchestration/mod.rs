//! External cluster-orchestration API.
//!
//! The console never assumes ordering or consistency between this API and the document store;
//! [`crate::coordinator`] bridges the two by watching the change log.
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod kube;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("orchestration api rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("orchestration api unreachable: {0}")]
    Transport(String),
}

/// A namespace as the orchestration API reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalNamespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodLogRequest {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub tail_lines: Option<u32>,
}

#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), OrchestrationError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestrationError>;

    async fn list_namespaces(&self) -> Result<Vec<ExternalNamespace>, OrchestrationError>;

    async fn pod_log(&self, request: &PodLogRequest) -> Result<String, OrchestrationError>;
}

/// Stand-in used when no orchestration API is configured; every call fails with
/// [`OrchestrationError::Transport`].
pub struct Unconfigured;

#[async_trait]
impl OrchestrationApi for Unconfigured {
    async fn create_namespace(
        &self,
        _name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<(), OrchestrationError> {
        Err(unconfigured())
    }

    async fn delete_namespace(&self, _name: &str) -> Result<(), OrchestrationError> {
        Err(unconfigured())
    }

    async fn list_namespaces(&self) -> Result<Vec<ExternalNamespace>, OrchestrationError> {
        Err(unconfigured())
    }

    async fn pod_log(&self, _request: &PodLogRequest) -> Result<String, OrchestrationError> {
        Err(unconfigured())
    }
}

fn unconfigured() -> OrchestrationError {
    OrchestrationError::Transport("no orchestration api configured".to_string())
}
