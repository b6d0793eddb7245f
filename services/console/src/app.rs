//! Console HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
use crate::actions::ActionDispatcher;
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::coordinator::NamespaceCoordinator;
use crate::observability;
use crate::orchestration::OrchestrationApi;
use crate::store::DocumentStore;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub dispatcher: Arc<ActionDispatcher>,
}

impl AppState {
    /// Wire the dispatcher and its coordinator over one store and orchestration API.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        orchestrator: Arc<dyn OrchestrationApi>,
        convergence_timeout: Duration,
    ) -> Self {
        let coordinator = Arc::new(NamespaceCoordinator::new(
            store.clone(),
            orchestrator.clone(),
            convergence_timeout,
        ));
        Self {
            dispatcher: Arc::new(ActionDispatcher::new(
                store.clone(),
                orchestrator,
                coordinator,
            )),
            store,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route(
            "/v1/system/health",
            axum::routing::get(api::system::system_health),
        )
        .route(
            "/v1/actions/:resource/:operation",
            axum::routing::post(api::actions::run_action),
        )
        .merge(
            utoipa_swagger_ui::SwaggerUi::new("/docs").url("/v1/openapi.json", ApiDoc::openapi()),
        )
        .layer(trace_layer)
        .with_state(state)
}
