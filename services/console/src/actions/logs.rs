//! Pod log retrieval, forwarded to the orchestration API.
use super::{Action, ActionOutput, ResourceKind};
use crate::error::ActionResult;
use crate::model::{Operation, User};
use crate::orchestration::{OrchestrationApi, PodLogRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct LogActions {
    orchestrator: Arc<dyn OrchestrationApi>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest {
    namespace: String,
    name: String,
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    tail_lines: Option<u32>,
}

impl LogActions {
    pub fn new(orchestrator: Arc<dyn OrchestrationApi>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Action for LogActions {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Logs
    }

    fn check_permissions(&self, _caller: &User, _operation: Operation, _body: &Value) -> bool {
        true
    }

    async fn retrieve(&self, _caller: &User, body: Value) -> ActionResult<ActionOutput> {
        let request: RetrieveRequest = serde_json::from_value(body)?;
        let log = self
            .orchestrator
            .pod_log(&PodLogRequest {
                namespace: request.namespace.clone(),
                pod: request.name.clone(),
                container: request.container,
                tail_lines: request.tail_lines,
            })
            .await?;
        Ok(ActionOutput::body(json!({
            "namespace": request.namespace,
            "name": request.name,
            "log": log,
        })))
    }
}
