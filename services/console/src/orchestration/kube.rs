//! HTTP client for a Kubernetes-compatible API server.
use super::{ExternalNamespace, OrchestrationApi, OrchestrationError, PodLogRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct KubeClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct NamespaceList {
    #[serde(default)]
    items: Vec<NamespaceItem>,
}

#[derive(Debug, Deserialize)]
struct NamespaceItem {
    metadata: ItemMetadata,
}

#[derive(Debug, Deserialize)]
struct ItemMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl KubeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            token,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> Result<reqwest::Response, OrchestrationError> {
        let response = builder
            .send()
            .await
            .map_err(|e| OrchestrationError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.bytes().await.unwrap_or_default();
        let message = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
        Err(match status {
            StatusCode::CONFLICT => OrchestrationError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            StatusCode::NOT_FOUND => OrchestrationError::NotFound {
                kind,
                name: name.to_string(),
            },
            _ => OrchestrationError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl OrchestrationApi for KubeClient {
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), OrchestrationError> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name, "labels": labels},
        });
        let builder = self
            .request(reqwest::Method::POST, "/api/v1/namespaces")
            .json(&body);
        self.send(builder, "namespace", name).await?;
        tracing::debug!(namespace = name, "created external namespace");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestrationError> {
        let builder = self.request(
            reqwest::Method::DELETE,
            &format!("/api/v1/namespaces/{name}"),
        );
        self.send(builder, "namespace", name).await?;
        tracing::debug!(namespace = name, "deleted external namespace");
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<ExternalNamespace>, OrchestrationError> {
        let builder = self.request(reqwest::Method::GET, "/api/v1/namespaces");
        let list: NamespaceList = self
            .send(builder, "namespace", "*")
            .await?
            .json()
            .await
            .map_err(|e| OrchestrationError::Transport(format!("invalid namespace list: {e}")))?;
        Ok(list
            .items
            .into_iter()
            .map(|item| ExternalNamespace {
                name: item.metadata.name,
                labels: item.metadata.labels,
            })
            .collect())
    }

    async fn pod_log(&self, request: &PodLogRequest) -> Result<String, OrchestrationError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(container) = &request.container {
            query.push(("container", container.clone()));
        }
        if let Some(tail_lines) = request.tail_lines {
            query.push(("tailLines", tail_lines.to_string()));
        }
        let builder = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/api/v1/namespaces/{}/pods/{}/log",
                    request.namespace, request.pod
                ),
            )
            .query(&query);
        self.send(builder, "pod", &request.pod)
            .await?
            .text()
            .await
            .map_err(|e| OrchestrationError::Transport(e.to_string()))
    }
}
