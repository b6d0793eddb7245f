//! OpenAPI schema aggregation for the console API.
use crate::actions::ResourceKind;
use crate::api::types::{ActionPayload, ErrorResponse, HealthStatus};
use crate::api::{actions, system};
use crate::model::Operation;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "console",
        version = "v1",
        description = "Cluster console action API"
    ),
    paths(system::system_health, actions::run_action),
    components(schemas(HealthStatus, ErrorResponse, ActionPayload, ResourceKind, Operation)),
    tags(
        (name = "system", description = "Health checks"),
        (name = "actions", description = "Resource actions")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/v1/system/health"));
        assert!(
            paths
                .iter()
                .any(|p| p.as_str() == "/v1/actions/{resource}/{operation}")
        );
    }
}
